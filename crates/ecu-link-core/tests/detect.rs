use ecu_link_core::config::DetectorConfig;
use ecu_link_core::detect::{DetectedPort, DetectorMode, FoundCallback, PortDetector, ProbeOutcome};
use ecu_link_core::protocol::mock::{Elm327Sim, MockOpener, MockTransport};
use ecu_link_core::protocol::{Packet, Transport};
use pretty_assertions::assert_eq;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const GRACE: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(deadline_ms: u64) -> DetectorConfig {
    let mut config = DetectorConfig {
        deadline_ms,
        ..DetectorConfig::default()
    };
    config.adapter.detect_timeout_ms = 60;
    config.handshake.timeout_ms = 60;
    config
}

/// ECU that answers the greeting after `delay`
fn slow_ecu(name: &str, delay: Duration) -> MockTransport {
    let response = Packet::new(b"\x00rusEFI 2024.05.01".to_vec()).to_bytes();
    MockTransport::with_responder(name, move |_| {
        thread::sleep(delay);
        vec![response.clone()]
    })
}

/// Adapter that answers each command after `delay`
fn slow_adapter(name: &str, delay: Duration) -> MockTransport {
    let mut sim = Elm327Sim::new(true);
    MockTransport::with_responder(name, move |data| {
        thread::sleep(delay);
        sim.feed(data)
    })
}

/// Device that takes `delay` to say something useless
fn slow_garbage(name: &str, delay: Duration) -> MockTransport {
    MockTransport::with_responder(name, move |_| {
        thread::sleep(delay);
        vec![b"\xff\xfe?\r>".to_vec()]
    })
}

fn wait_all_closed(opener: &MockOpener, except: Option<&str>) {
    let deadline = Instant::now() + GRACE;
    loop {
        let open: Vec<String> = opener
            .opened()
            .iter()
            .filter(|t| !t.is_closed() && Some(t.port_name()) != except)
            .map(|t| t.port_name().to_string())
            .collect();
        if open.is_empty() {
            return;
        }
        assert!(Instant::now() < deadline, "transports left open: {:?}", open);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_single_winner_with_random_delays() {
    init_tracing();
    let mut rng = rand::thread_rng();

    for round in 0..5 {
        let ports: Vec<String> = (1..=6).map(|i| format!("COM{}", i)).collect();
        let winner = ports[rng.gen_range(0..ports.len())].clone();

        let mut opener = MockOpener::new();
        for port in &ports {
            let delay = Duration::from_millis(rng.gen_range(0..40));
            let name = port.clone();
            opener = if *port == winner {
                opener.add(port, move || slow_ecu(&name, delay))
            } else {
                opener.add(port, move || slow_garbage(&name, delay))
            };
        }
        let opener = Arc::new(opener);

        let detector = PortDetector::with_opener(opener.clone(), config(2000));
        let race = detector.start(&ports[..], DetectorMode::BinaryProtocol);
        let outcome = race.wait(Duration::from_secs(2));

        assert_eq!(
            outcome,
            ProbeOutcome::Found(DetectedPort {
                port: winner.clone(),
                signature: Some("rusEFI 2024.05.01".to_string()),
            }),
            "round {}",
            round
        );
        wait_all_closed(&opener, None);
        assert_eq!(opener.opened().len(), ports.len());
    }
}

#[test]
fn test_first_of_several_successes_wins() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || slow_ecu("COM1", Duration::from_millis(150)))
            .add("COM2", || slow_ecu("COM2", Duration::from_millis(0))),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(2000));
    let race = detector.start(&["COM1", "COM2"], DetectorMode::BinaryProtocol);
    assert_eq!(race.wait(Duration::from_secs(2)).port(), Some("COM2"));

    // the later success is discarded, but its port still gets closed
    race.join();
    wait_all_closed(&opener, None);
}

/// Records every callback as (port, signature, transport closed at call time)
fn recording_callback() -> (FoundCallback, Arc<Mutex<Vec<(String, Option<String>, bool)>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let callback: FoundCallback = Arc::new(move |transport: &dyn Transport, found: &DetectedPort| {
        sink.lock()
            .unwrap()
            .push((found.port.clone(), found.signature.clone(), transport.is_closed()));
    });
    (callback, calls)
}

#[test]
fn test_found_callback_runs_once_on_winner() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || slow_ecu("COM1", Duration::from_millis(150)))
            .add("COM2", || slow_ecu("COM2", Duration::ZERO))
            .add("COM3", || slow_garbage("COM3", Duration::ZERO)),
    );
    let (callback, calls) = recording_callback();
    let detector = PortDetector::with_opener(opener.clone(), config(2000)).on_found(callback);

    let race = detector.start(&["COM1", "COM2", "COM3"], DetectorMode::BinaryProtocol);
    assert_eq!(race.wait(Duration::from_secs(2)).port(), Some("COM2"));
    race.join();
    wait_all_closed(&opener, None);

    assert_eq!(
        *calls.lock().unwrap(),
        vec![(
            "COM2".to_string(),
            Some("rusEFI 2024.05.01".to_string()),
            false
        )]
    );
}

#[test]
fn test_found_callback_in_adapter_mode() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || MockTransport::silent("COM1"))
            .add("COM2", || MockTransport::elm327("COM2", true)),
    );
    let (callback, calls) = recording_callback();
    let detector = PortDetector::with_opener(opener.clone(), config(2000)).on_found(callback);

    assert_eq!(
        detector.detect(&["COM1", "COM2"], DetectorMode::Adapter).port(),
        Some("COM2")
    );
    assert_eq!(*calls.lock().unwrap(), vec![("COM2".to_string(), None, false)]);
    wait_all_closed(&opener, None);
}

#[test]
fn test_not_found_only_after_deadline() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || MockTransport::silent("COM1"))
            .add("COM2", || slow_garbage("COM2", Duration::ZERO)),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(300));

    let start = Instant::now();
    let outcome = detector.detect(&["COM1", "COM2", "COM3"], DetectorMode::Adapter);
    assert_eq!(outcome, ProbeOutcome::NotFound);
    assert!(start.elapsed() >= Duration::from_millis(300));
    wait_all_closed(&opener, None);
}

#[test]
fn test_straggler_still_closes_after_deadline() {
    let opener = Arc::new(
        MockOpener::new().add("COM1", || slow_garbage("COM1", Duration::from_millis(200))),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(50));
    let race = detector.start(&["COM1"], DetectorMode::Adapter);
    assert_eq!(race.wait(Duration::from_millis(50)), ProbeOutcome::NotFound);

    race.join();
    assert!(opener.opened_for("COM1")[0].is_closed());
}

#[test]
fn test_end_to_end_adapter_on_com2() {
    init_tracing();
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || MockTransport::silent("COM1"))
            .add("COM2", || slow_adapter("COM2", Duration::from_millis(5)))
            .add("COM3", || slow_garbage("COM3", Duration::from_millis(5))),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(2000));
    let outcome = detector.detect(&["COM1", "COM2", "COM3"], DetectorMode::Adapter);

    assert_eq!(
        outcome,
        ProbeOutcome::Found(DetectedPort {
            port: "COM2".to_string(),
            signature: None,
        })
    );
    wait_all_closed(&opener, None);
    for port in ["COM1", "COM2", "COM3"] {
        assert_eq!(opener.opened_for(port).len(), 1, "{}", port);
        assert_eq!(opener.opened_for(port)[0].close_calls(), 1, "{}", port);
    }
    assert_eq!(opener.opened_for("COM2")[0].written_lines(), vec!["ATZ"]);
}

#[test]
fn test_end_to_end_binary_protocol_on_com2() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || MockTransport::ecu("COM1", 0x00, "speeduino 202402"))
            .add("COM2", || MockTransport::ecu("COM2", 0x00, "rusEFI master.2024"))
            .add("COM3", || MockTransport::ecu("COM3", 0x80, "rusEFI master.2024")),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(2000));
    let outcome = detector.detect(&["COM1", "COM2", "COM3"], DetectorMode::BinaryProtocol);

    assert_eq!(outcome.port(), Some("COM2"));
    if let ProbeOutcome::Found(found) = outcome {
        assert_eq!(found.signature.as_deref(), Some("rusEFI master.2024"));
    }
    wait_all_closed(&opener, None);
}

#[tokio::test]
async fn test_detect_async() {
    let opener = Arc::new(
        MockOpener::new()
            .add("COM1", || MockTransport::silent("COM1"))
            .add("COM2", || MockTransport::elm327("COM2", false)),
    );
    let detector = PortDetector::with_opener(opener.clone(), config(2000));
    let outcome = detector
        .detect_async(vec!["COM1".to_string(), "COM2".to_string()], DetectorMode::Adapter)
        .await;
    assert_eq!(outcome.port(), Some("COM2"));
}
