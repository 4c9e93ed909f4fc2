//! Fan-out of a buffer into the canonical binary sink plus a text
//! projection, exercising the protocol packet types end to end.

use std::fs;
use std::time::Duration;

use tempfile::TempDir;

use baldaquin::pkt::{Packet, PacketFile};
use baldaquin::protocol::AnalogReadout;
use baldaquin::{FifoBuffer, PacketBuffer, Projection, WriteMode};

fn readout(milliseconds: u32, adc_value: u16) -> AnalogReadout {
    AnalogReadout::from_fields(0, milliseconds, adc_value).unwrap()
}

#[test]
fn fan_out_to_text_projection() {
    let folder = TempDir::new().unwrap();
    let binary_path = folder.path().join("data.dat");
    let text_path = folder.path().join("data.txt");
    let buffer = FifoBuffer::new(100, 50, Duration::from_secs(60)).unwrap();
    buffer
        .add_sink(&binary_path, WriteMode::Binary, None, None)
        .unwrap();
    let projection: Projection<AnalogReadout> =
        Box::new(|packet| packet.to_text().into_bytes());
    let header = AnalogReadout::text_header("fanout test", "ADC counts");
    buffer
        .add_sink(
            &text_path,
            WriteMode::Text,
            Some(projection),
            Some(header.as_bytes()),
        )
        .unwrap();

    buffer.put(readout(100, 1));
    buffer.put(readout(200, 2));
    buffer.put(readout(300, 3));
    let (num_packets, num_bytes) = buffer.flush().unwrap();
    assert_eq!(num_packets, 3);
    assert_eq!(buffer.size(), 0);

    // The canonical sink holds exactly three records, no framing.
    let binary_length = fs::metadata(&binary_path).unwrap().len();
    assert_eq!(binary_length, 3 * AnalogReadout::SIZE as u64);
    let packets = PacketFile::<AnalogReadout>::open(&binary_path)
        .unwrap()
        .read_all()
        .unwrap();
    assert_eq!(
        packets,
        vec![readout(100, 1), readout(200, 2), readout(300, 3)]
    );

    // The text sink holds the header lines plus one row per packet.
    let text = fs::read_to_string(&text_path).unwrap();
    assert!(text.starts_with(&header));
    let rows: Vec<&str> = text[header.len()..].lines().collect();
    assert_eq!(rows, vec!["0, 0.100, 1", "0, 0.200, 2", "0, 0.300, 3"]);

    // The flush accounted for both sinks.
    let text_length = fs::metadata(&text_path).unwrap().len();
    assert_eq!(
        num_bytes,
        binary_length + text_length - header.len() as u64
    );

    // A second flush with an empty buffer leaves both files alone.
    assert_eq!(buffer.flush().unwrap(), (0, 0));
    assert_eq!(fs::metadata(&binary_path).unwrap().len(), binary_length);
    assert_eq!(fs::metadata(&text_path).unwrap().len(), text_length);
}
