use ecu_link_core::adapter::isotp::{self, IsoTpFrame, IsoTpReassembler, Reassembly};
use ecu_link_core::adapter::LineFramer;
use pretty_assertions::assert_eq;
use rand::Rng;

/// Serialize frames the way they travel on the adapter channel
fn to_wire(frames: &[IsoTpFrame]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|f| format!("{}\r", f.to_hex()).into_bytes())
        .collect()
}

#[test]
fn test_random_payloads_survive_random_chunking() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let len = rng.gen_range(0..=isotp::MAX_PAYLOAD_LEN);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let wire = to_wire(&isotp::segment(&payload).unwrap());

        let mut framer = LineFramer::new();
        let mut rx = IsoTpReassembler::new();
        let mut result = None;
        let mut rest = &wire[..];
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(40));
            let (chunk, tail) = rest.split_at(n);
            rest = tail;
            let mut lines = Vec::new();
            framer.push(chunk, |line| lines.push(line));
            for line in lines {
                let frame = IsoTpFrame::from_hex(&line).unwrap();
                if let Reassembly::Complete(data) = rx.push(frame).unwrap() {
                    assert!(result.is_none(), "payload completed twice");
                    result = Some(data);
                }
            }
        }
        assert_eq!(result, Some(payload));
    }
}

#[test]
fn test_frame_counts() {
    assert_eq!(isotp::segment(&[]).unwrap().len(), 1);
    assert_eq!(isotp::segment(&[0; 7]).unwrap().len(), 1);
    assert_eq!(isotp::segment(&[0; 8]).unwrap().len(), 2);
    assert_eq!(isotp::segment(&[0; 13]).unwrap().len(), 2);
    assert_eq!(isotp::segment(&[0; 14]).unwrap().len(), 3);
    // first frame plus 585 consecutive frames
    assert_eq!(isotp::segment(&[0; 4095]).unwrap().len(), 586);
}

#[test]
fn test_every_frame_fits_can() {
    let frames = isotp::segment(&[0xA5; 1000]).unwrap();
    for frame in frames {
        let bytes = frame.to_bytes();
        assert!(bytes.len() <= isotp::CAN_FRAME_LEN);
        let hex = frame.to_hex();
        assert_eq!(hex, hex.to_uppercase());
        assert_eq!(hex.len(), bytes.len() * 2);
    }
}

#[test]
fn test_duplicate_frame_discards_transfer() {
    let frames = isotp::segment(&[1u8; 40]).unwrap();
    let mut rx = IsoTpReassembler::new();
    rx.push(frames[0].clone()).unwrap();
    rx.push(frames[1].clone()).unwrap();
    assert!(rx.push(frames[1].clone()).is_err());
    assert!(!rx.in_progress());

    // a fresh transfer still works afterwards
    let mut result = None;
    for frame in frames {
        if let Reassembly::Complete(data) = rx.push(frame).unwrap() {
            result = Some(data);
        }
    }
    assert_eq!(result, Some(vec![1u8; 40]));
}

#[test]
fn test_padded_frames_from_ecu() {
    let mut rx = IsoTpReassembler::new();
    assert_eq!(
        rx.push(IsoTpFrame::from_hex("10 09 01 02 03 04 05 06").unwrap())
            .unwrap(),
        Reassembly::NeedFlowControl
    );
    assert_eq!(
        rx.push(IsoTpFrame::from_hex("21 07 08 09 AA AA AA AA").unwrap())
            .unwrap(),
        Reassembly::Complete(vec![1, 2, 3, 4, 5, 6, 7, 8, 9])
    );
}
