//! Sketch communication protocol.
//!
//! Markers, opcodes and concrete packet types for the microcontroller
//! sketches sampling analog pins and timestamping digital transitions. The
//! serial transport itself lives outside the core; what belongs here is the
//! wire format: every record starts with a one-byte header marker, and a
//! dedicated end-of-run marker terminates the stream after a stop command.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::timeline::Timeline;

/// Prefix for the comment lines of the text projections.
pub const COMMENT_PREFIX: &str = "# ";

/// Field separator for the text projections.
pub const TEXT_SEPARATOR: &str = ", ";

/// Protocol markers prefixing (or, for the run-end marker, terminating) the
/// records on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Marker {
    /// No-op record header.
    NoOpHeader = 0xA0,
    /// Digital transition record header.
    DigitalTransitionHeader = 0xA1,
    /// Analog readout record header.
    AnalogReadoutHeader = 0xA2,
    /// GPS message record header.
    GpsMessageHeader = 0xA3,
    /// End-of-run marker, emitted once after a stop command.
    RunEndMarker = 0xB0,
}

/// Operational codes written to the source to control the sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum OpCode {
    NoOp = 0x00,
    StartRun = 0x01,
    StopRun = 0x02,
    SelectNumDigitalPins = 0x03,
    SelectDigitalPin = 0x04,
    SelectNumAnalogPins = 0x05,
    SelectAnalogPin = 0x06,
    SelectSamplingInterval = 0x07,
    SelectInterruptMode = 0x08,
    SelectPwmDutyCycle = 0x09,
    SelectPollingMode = 0x0A,
    Ad9833Cmd = 0x0B,
    ToggleLed = 0x0C,
    ToggleDigitalPin = 0x0D,
}

/// The edge type of a transition on a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Edge {
    /// Falling edge.
    Falling = 0,
    /// Rising edge.
    Rising = 1,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// The common comment lines opening every text projection file.
pub fn text_header_prefix(creator: &str) -> String {
    format!(
        "{}Created by {} on {}\n",
        COMMENT_PREFIX,
        creator,
        Timeline::new().latch().local_datetime_string()
    )
}

crate::packetclass! {
    /// An analog readout: a big-endian 8-byte record carrying the header
    /// marker, the analog pin number, the timestamp of the readout from the
    /// sketch `millis()` and the ADC value.
    #[derive(Debug, Clone, PartialEq)]
    pub struct AnalogReadout {
        layout: crate::pkt::Layout::BigEndian;
        header: u8 = Marker::AnalogReadoutHeader as u8,
        pin_number: u8,
        milliseconds: u32,
        adc_value: u16,
    }
}

impl AnalogReadout {
    /// Create a readout without spelling the header marker out.
    pub fn from_fields(
        pin_number: u8,
        milliseconds: u32,
        adc_value: u16,
    ) -> Result<Self, crate::pkt::PacketError> {
        Self::new(
            Marker::AnalogReadoutHeader as u8,
            pin_number,
            milliseconds,
            adc_value,
        )
    }

    /// The timestamp of the readout, in seconds.
    pub fn seconds(&self) -> f64 {
        1.0e-3 * f64::from(self.milliseconds)
    }

    /// The header for the output text file.
    pub fn text_header(creator: &str, label: &str) -> String {
        format!(
            "{}{}Pin number{}Time [s]{}{}\n",
            text_header_prefix(creator),
            COMMENT_PREFIX,
            TEXT_SEPARATOR,
            TEXT_SEPARATOR,
            label
        )
    }

    /// Render the readout as one text row.
    pub fn to_text(&self) -> String {
        format!(
            "{}{}{:.3}{}{}\n",
            self.pin_number,
            TEXT_SEPARATOR,
            self.seconds(),
            TEXT_SEPARATOR,
            self.adc_value
        )
    }
}

crate::packetclass! {
    /// A digital transition: a big-endian 6-byte record carrying the header
    /// marker, the transition information (pin number and edge type packed
    /// into one byte) and the timestamp of the transition from the sketch
    /// `micros()`.
    #[derive(Debug, Clone, PartialEq)]
    pub struct DigitalTransition {
        layout: crate::pkt::Layout::BigEndian;
        header: u8 = Marker::DigitalTransitionHeader as u8,
        info: u8,
        microseconds: u32,
    }
}

impl DigitalTransition {
    /// Create a transition without spelling the header marker out.
    pub fn from_fields(
        info: u8,
        microseconds: u32,
    ) -> Result<Self, crate::pkt::PacketError> {
        Self::new(Marker::DigitalTransitionHeader as u8, info, microseconds)
    }

    /// The pin number, packed in the lower bits of the info byte.
    pub fn pin_number(&self) -> u8 {
        self.info & 0x7F
    }

    /// The edge type, packed in the most significant bit of the info byte.
    pub fn edge(&self) -> Edge {
        if (self.info >> 7) & 0x1 == 1 {
            Edge::Rising
        } else {
            Edge::Falling
        }
    }

    /// The timestamp of the transition, in seconds.
    pub fn seconds(&self) -> f64 {
        1.0e-6 * f64::from(self.microseconds)
    }

    /// The header for the output text file.
    pub fn text_header(creator: &str) -> String {
        format!(
            "{}{}Time [s]{}Edge type\n",
            text_header_prefix(creator),
            COMMENT_PREFIX,
            TEXT_SEPARATOR
        )
    }

    /// Render the transition as one text row.
    pub fn to_text(&self) -> String {
        format!("{:.6}{}{}\n", self.seconds(), TEXT_SEPARATOR, self.edge())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::Packet;

    #[test]
    fn markers() {
        assert_eq!(u8::from(Marker::RunEndMarker), 0xB0);
        assert_eq!(Marker::try_from(0xA2).unwrap(), Marker::AnalogReadoutHeader);
        assert!(Marker::try_from(0x42).is_err());
    }

    #[test]
    fn analog_readout_layout() {
        assert_eq!(AnalogReadout::SIZE, 8);
        let readout = AnalogReadout::from_fields(2, 1000, 513).unwrap();
        assert_eq!(
            readout.pack(),
            vec![0xA2, 0x02, 0x00, 0x00, 0x03, 0xE8, 0x02, 0x01]
        );
        assert_eq!(readout.seconds(), 1.);
        assert_eq!(AnalogReadout::unpack(&readout.pack()).unwrap(), readout);
    }

    #[test]
    fn analog_readout_header_enforced() {
        let mut data = AnalogReadout::from_fields(0, 0, 0).unwrap().pack();
        data[0] = Marker::NoOpHeader as u8;
        assert!(AnalogReadout::unpack(&data).is_err());
    }

    #[test]
    fn digital_transition_layout() {
        assert_eq!(DigitalTransition::SIZE, 6);
        // Rising edge on pin 3.
        let transition = DigitalTransition::from_fields(0x83, 1_000_000).unwrap();
        assert_eq!(transition.pin_number(), 3);
        assert_eq!(transition.edge(), Edge::Rising);
        assert_eq!(transition.seconds(), 1.);
        // Falling edge on pin 3.
        let transition = DigitalTransition::from_fields(0x03, 500_000).unwrap();
        assert_eq!(transition.edge(), Edge::Falling);
    }

    #[test]
    fn text_projection() {
        let readout = AnalogReadout::from_fields(1, 1500, 42).unwrap();
        assert_eq!(readout.to_text(), "1, 1.500, 42\n");
        let header = AnalogReadout::text_header("baldaquin", "ADC counts");
        assert!(header.starts_with("# Created by baldaquin"));
        assert!(header.ends_with("# Pin number, Time [s], ADC counts\n"));
        let transition = DigitalTransition::from_fields(0x83, 1_000_000).unwrap();
        assert_eq!(transition.to_text(), "1.000000, 1\n");
    }
}
