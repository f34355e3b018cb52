//! Port auto-detection
//!
//! Every candidate port gets its own probe thread. The first probe that
//! succeeds publishes its port into a shared slot and wakes the caller;
//! later successes are ignored. Probes are never interrupted: losers and
//! stragglers finish on their own and always close their port.
//!
//! A [`FoundCallback`] gets to use the winning port's connection before it
//! is closed. The first successful probe claims the win while its port is
//! still open and publishes only after closing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::AdapterSession;
use crate::config::DetectorConfig;
use crate::handshake::HandshakeChecker;
use crate::protocol::serial::list_port_names;
use crate::protocol::transport::lock;
use crate::protocol::{PortOpener, SerialOpener, Transport};

/// What a probe looks for on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// An ELM327-class adapter answering `ATZ`
    Adapter,
    /// An ECU answering the binary protocol greeting with our signature
    BinaryProtocol,
}

/// Progress of one port's probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Thread spawned, port not opened yet
    Idle,
    /// Check running
    Probing,
    /// Check succeeded
    Found,
    /// Check failed or the port could not be opened
    NotFound,
}

/// The port a race settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port name
    pub port: String,
    /// ECU signature, for [`DetectorMode::BinaryProtocol`]
    pub signature: Option<String>,
}

/// Result of waiting on a race
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A probe succeeded before the deadline
    Found(DetectedPort),
    /// The deadline passed without a success
    NotFound,
}

impl ProbeOutcome {
    /// Name of the detected port
    pub fn port(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Found(detected) => Some(&detected.port),
            ProbeOutcome::NotFound => None,
        }
    }

    /// Whether a port was detected
    pub fn is_found(&self) -> bool {
        matches!(self, ProbeOutcome::Found(_))
    }
}

/// Called with the winning port's open transport, before it is closed
pub type FoundCallback = Arc<dyn Fn(&dyn Transport, &DetectedPort) + Send + Sync>;

#[derive(Default)]
struct RaceShared {
    claimed: AtomicBool,
    winner: Mutex<Option<DetectedPort>>,
    published: Condvar,
    states: Mutex<Vec<(String, ProbeState)>>,
}

impl RaceShared {
    fn set_state(&self, index: usize, state: ProbeState) {
        if let Some(entry) = lock(&self.states).get_mut(index) {
            entry.1 = state;
        }
    }

    /// Reserve the win; true for the first caller only
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// First write wins; returns whether this call won
    fn publish(&self, detected: DetectedPort) -> bool {
        let mut winner = lock(&self.winner);
        if winner.is_some() {
            return false;
        }
        *winner = Some(detected);
        self.published.notify_all();
        true
    }
}

/// A running race between port probes
pub struct Race {
    shared: Arc<RaceShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Race {
    /// Block until a probe succeeds or `timeout` elapses.
    ///
    /// `NotFound` is only returned once the full timeout has passed, even if
    /// every probe already gave up.
    pub fn wait(&self, timeout: Duration) -> ProbeOutcome {
        let winner = lock(&self.shared.winner);
        let (winner, _) = match self
            .shared
            .published
            .wait_timeout_while(winner, timeout, |w| w.is_none())
        {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        match winner.as_ref() {
            Some(detected) => ProbeOutcome::Found(detected.clone()),
            None => ProbeOutcome::NotFound,
        }
    }

    /// Current state of every probe, in port order
    pub fn states(&self) -> Vec<(String, ProbeState)> {
        lock(&self.shared.states).clone()
    }

    /// True once no probe is still running
    pub fn is_finished(&self) -> bool {
        self.states()
            .iter()
            .all(|(_, state)| matches!(state, ProbeState::Found | ProbeState::NotFound))
    }

    /// Wait for every probe thread to exit
    pub fn join(self) {
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("probe thread panicked");
            }
        }
    }
}

/// Races probes over a set of ports
#[derive(Clone)]
pub struct PortDetector {
    opener: Arc<dyn PortOpener>,
    config: DetectorConfig,
    on_found: Option<FoundCallback>,
}

impl PortDetector {
    /// Detector probing real serial ports
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_opener(Arc::new(SerialOpener), config)
    }

    /// Detector opening ports through `opener`
    pub fn with_opener(opener: Arc<dyn PortOpener>, config: DetectorConfig) -> Self {
        Self {
            opener,
            config,
            on_found: None,
        }
    }

    /// Run `callback` on the winner's connection before its port is closed.
    ///
    /// Called at most once per race; later successes never see it.
    pub fn on_found(mut self, callback: FoundCallback) -> Self {
        self.on_found = Some(callback);
        self
    }

    /// Detector settings in use
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Spawn one probe per port and return without waiting
    pub fn start<S: AsRef<str>>(&self, ports: &[S], mode: DetectorMode) -> Race {
        let shared = Arc::new(RaceShared::default());
        *lock(&shared.states) = ports
            .iter()
            .map(|p| (p.as_ref().to_string(), ProbeState::Idle))
            .collect();

        let mut workers = Vec::with_capacity(ports.len());
        for (index, port) in ports.iter().enumerate() {
            let port = port.as_ref().to_string();
            let shared_for_worker = shared.clone();
            let opener = self.opener.clone();
            let config = self.config.clone();
            let on_found = self.on_found.clone();
            let spawned = thread::Builder::new()
                .name(format!("probe {}", port))
                .spawn({
                    let port = port.clone();
                    move || {
                        let probe = Probe {
                            index,
                            port,
                            mode,
                            opener,
                            config,
                            on_found,
                        };
                        probe.run(&shared_for_worker)
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    warn!("{}: cannot start probe thread: {}", port, e);
                    shared.set_state(index, ProbeState::NotFound);
                }
            }
        }

        Race { shared, workers }
    }

    /// Race `ports` and wait up to the configured deadline
    pub fn detect<S: AsRef<str>>(&self, ports: &[S], mode: DetectorMode) -> ProbeOutcome {
        let race = self.start(ports, mode);
        race.wait(self.config.deadline())
    }

    /// [`detect`](Self::detect) on tokio's blocking pool
    pub async fn detect_async(&self, ports: Vec<String>, mode: DetectorMode) -> ProbeOutcome {
        let detector = self.clone();
        match tokio::task::spawn_blocking(move || detector.detect(&ports[..], mode)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("port detection task failed: {}", e);
                ProbeOutcome::NotFound
            }
        }
    }

    /// Race every serial port present on the system
    pub fn auto_detect(&self, mode: DetectorMode) -> ProbeOutcome {
        let ports = list_port_names();
        info!("probing {} port(s): {:?}", ports.len(), ports);
        self.detect(&ports[..], mode)
    }
}

struct Probe {
    index: usize,
    port: String,
    mode: DetectorMode,
    opener: Arc<dyn PortOpener>,
    config: DetectorConfig,
    on_found: Option<FoundCallback>,
}

impl Probe {
    fn run(self, shared: &RaceShared) {
        shared.set_state(self.index, ProbeState::Probing);
        debug!("{}: probing for {:?}", self.port, self.mode);

        let mut won = false;
        let mut claim = |transport: &dyn Transport, detected: &DetectedPort| {
            won = shared.claim();
            if let (true, Some(callback)) = (won, self.on_found.as_ref()) {
                callback(transport, detected);
            }
        };

        // both checks close the port before returning
        let detected = match self.mode {
            DetectorMode::Adapter => {
                let detected = DetectedPort {
                    port: self.port.clone(),
                    signature: None,
                };
                let found = AdapterSession::check_connection_with(
                    self.opener.as_ref(),
                    &self.port,
                    &self.config.adapter,
                    |transport, _| claim(transport, &detected),
                );
                found.then_some(detected)
            }
            DetectorMode::BinaryProtocol => {
                let mut detected = None;
                HandshakeChecker::new(self.config.handshake.clone()).check_port_with(
                    self.opener.as_ref(),
                    &self.port,
                    |transport, signature| {
                        let found = DetectedPort {
                            port: self.port.clone(),
                            signature: Some(signature.to_string()),
                        };
                        claim(transport, &found);
                        detected = Some(found);
                    },
                );
                detected
            }
        };

        match detected {
            Some(detected) => {
                shared.set_state(self.index, ProbeState::Found);
                if won && shared.publish(detected) {
                    info!("{}: detected", self.port);
                } else {
                    debug!("{}: found, but another port won", self.port);
                }
            }
            None => shared.set_state(self.index, ProbeState::NotFound),
        }
    }
}

/// Race `ports` over real serial ports
pub fn detect_port<S: AsRef<str>>(
    ports: &[S],
    mode: DetectorMode,
    config: &DetectorConfig,
) -> ProbeOutcome {
    PortDetector::new(config.clone()).detect(ports, mode)
}

/// [`detect_port`] for async callers
pub async fn detect_port_async(
    ports: Vec<String>,
    mode: DetectorMode,
    config: DetectorConfig,
) -> ProbeOutcome {
    PortDetector::new(config).detect_async(ports, mode).await
}

/// Race every serial port present on the system
pub fn auto_detect(mode: DetectorMode, config: &DetectorConfig) -> ProbeOutcome {
    PortDetector::new(config.clone()).auto_detect(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::{MockOpener, MockTransport};
    use crate::protocol::Transport;
    use std::time::Instant;

    fn fast_config(deadline_ms: u64) -> DetectorConfig {
        let mut config = DetectorConfig {
            deadline_ms,
            ..DetectorConfig::default()
        };
        config.adapter.detect_timeout_ms = 40;
        config.handshake.timeout_ms = 40;
        config
    }

    #[test]
    fn test_publish_once() {
        let shared = RaceShared::default();
        let a = DetectedPort {
            port: "COM1".to_string(),
            signature: None,
        };
        let b = DetectedPort {
            port: "COM2".to_string(),
            signature: None,
        };
        assert!(shared.publish(a.clone()));
        assert!(!shared.publish(b));
        assert_eq!(lock(&shared.winner).clone(), Some(a));
    }

    #[test]
    fn test_binary_protocol_race() {
        let opener = Arc::new(
            MockOpener::new()
                .add("COM1", || MockTransport::silent("COM1"))
                .add("COM2", || MockTransport::ecu("COM2", 0, "rusEFI 2024")),
        );
        let detector = PortDetector::with_opener(opener.clone(), fast_config(2000));
        let race = detector.start(&["COM1", "COM2"], DetectorMode::BinaryProtocol);
        let outcome = race.wait(Duration::from_secs(2));
        assert_eq!(
            outcome,
            ProbeOutcome::Found(DetectedPort {
                port: "COM2".to_string(),
                signature: Some("rusEFI 2024".to_string()),
            })
        );

        race.join();
        for transport in opener.opened() {
            assert!(transport.is_closed(), "{} left open", transport.port_name());
        }
    }

    #[test]
    fn test_states_settle() {
        let opener = Arc::new(
            MockOpener::new()
                .add("COM1", || MockTransport::elm327("COM1", true))
                .add("COM2", || MockTransport::silent("COM2")),
        );
        let detector = PortDetector::with_opener(opener, fast_config(500));
        let race = detector.start(&["COM1", "COM2", "COM3"], DetectorMode::Adapter);
        assert_eq!(race.wait(Duration::from_secs(2)).port(), Some("COM1"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !race.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            race.states(),
            vec![
                ("COM1".to_string(), ProbeState::Found),
                ("COM2".to_string(), ProbeState::NotFound),
                ("COM3".to_string(), ProbeState::NotFound),
            ]
        );
    }

    #[test]
    fn test_not_found_waits_for_deadline() {
        let opener = Arc::new(MockOpener::new());
        let detector = PortDetector::with_opener(opener, fast_config(100));
        let start = Instant::now();
        let outcome = detector.detect(&["COM8"], DetectorMode::Adapter);
        assert_eq!(outcome, ProbeOutcome::NotFound);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
