//! Signal identity helpers: signal kinds, signal references, and measurement
//! keys, plus the derivations used when building metadata (signal-type
//! acronyms, engineering units, protocol classification).

use std::fmt;
use std::str::FromStr;

use crate::error::{PublisherError, Result};

/// Fundamental kind of a time-series signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Angle,
    Magnitude,
    Frequency,
    DfDt,
    Status,
    Digital,
    Analog,
    Calculation,
    Statistic,
    Alarm,
    Quality,
    Unknown,
}

impl SignalKind {
    /// The exact two-letter acronym used inside signal references.
    pub fn acronym(&self) -> &'static str {
        match self {
            SignalKind::Angle => "PA",
            SignalKind::Magnitude => "PM",
            SignalKind::Frequency => "FQ",
            SignalKind::DfDt => "DF",
            SignalKind::Status => "SF",
            SignalKind::Digital => "DV",
            SignalKind::Analog => "AV",
            SignalKind::Calculation => "CV",
            SignalKind::Statistic => "ST",
            SignalKind::Alarm => "AL",
            SignalKind::Quality => "QF",
            SignalKind::Unknown => "??",
        }
    }

    /// Parses a two-letter acronym; anything unrecognized is `Unknown`.
    pub fn parse_acronym(acronym: &str) -> SignalKind {
        match acronym {
            "PA" => SignalKind::Angle,
            "PM" => SignalKind::Magnitude,
            "FQ" => SignalKind::Frequency,
            "DF" => SignalKind::DfDt,
            "SF" => SignalKind::Status,
            "DV" => SignalKind::Digital,
            "AV" => SignalKind::Analog,
            "CV" => SignalKind::Calculation,
            "ST" => SignalKind::Statistic,
            "AL" => SignalKind::Alarm,
            "QF" => SignalKind::Quality,
            _ => SignalKind::Unknown,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            SignalKind::Angle => "Angle",
            SignalKind::Magnitude => "Magnitude",
            SignalKind::Frequency => "Frequency",
            SignalKind::DfDt => "DfDt",
            SignalKind::Status => "Status",
            SignalKind::Digital => "Digital",
            SignalKind::Analog => "Analog",
            SignalKind::Calculation => "Calculation",
            SignalKind::Statistic => "Statistic",
            SignalKind::Alarm => "Alarm",
            SignalKind::Quality => "Quality",
            SignalKind::Unknown => "Unknown",
        };
        f.write_str(description)
    }
}

/// A parsed `"ACRONYM-XXn"` signal reference.
///
/// The kind suffix follows the last dash; a suffix longer than two characters
/// carries an integer index (e.g. `CORDOVA-PA2`). Formatting omits the index
/// when it is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalReference {
    pub acronym: String,
    pub kind: SignalKind,
    pub index: u32,
}

impl FromStr for SignalReference {
    type Err = PublisherError;

    fn from_str(signal: &str) -> Result<Self> {
        match signal.rfind('-') {
            None => Ok(SignalReference {
                // No dash at all: treat the whole string as the acronym.
                acronym: signal.trim().to_uppercase(),
                kind: SignalKind::Unknown,
                index: 0,
            }),
            Some(split) => {
                let acronym = signal[..split].trim().to_uppercase();
                let suffix = signal[split + 1..].trim().to_uppercase();

                if suffix.len() > 2 {
                    let kind = suffix
                        .get(..2)
                        .map(SignalKind::parse_acronym)
                        .unwrap_or(SignalKind::Unknown);
                    let index = if kind == SignalKind::Unknown {
                        0
                    } else {
                        suffix[2..].parse().map_err(|_| {
                            PublisherError::Configuration(format!(
                                "invalid signal reference index in \"{signal}\""
                            ))
                        })?
                    };
                    Ok(SignalReference { acronym, kind, index })
                } else {
                    Ok(SignalReference {
                        acronym,
                        kind: SignalKind::parse_acronym(&suffix),
                        index: 0,
                    })
                }
            }
        }
    }
}

impl fmt::Display for SignalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index > 0 {
            write!(f, "{}-{}{}", self.acronym, self.kind.acronym(), self.index)
        } else {
            write!(f, "{}-{}", self.acronym, self.kind.acronym())
        }
    }
}

/// A `source:id` measurement key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasurementKey {
    pub source: String,
    pub id: u32,
}

impl MeasurementKey {
    /// Parses `"SOURCE:id"`. A missing or unparseable id yields `u32::MAX`.
    pub fn parse(key: &str) -> MeasurementKey {
        match key.split_once(':') {
            Some((source, id)) => MeasurementKey {
                source: source.to_string(),
                id: id.trim().parse().unwrap_or(u32::MAX),
            },
            None => MeasurementKey {
                source: key.to_string(),
                id: u32::MAX,
            },
        }
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Derives the four-letter signal-type acronym from a kind and phasor type
/// (`'V'` or `'I'`).
pub fn signal_type_acronym(kind: SignalKind, phasor_type: char) -> &'static str {
    let is_voltage = phasor_type.eq_ignore_ascii_case(&'V');
    match kind {
        SignalKind::Angle => {
            if is_voltage {
                "VPHA"
            } else {
                "IPHA"
            }
        }
        SignalKind::Magnitude => {
            if is_voltage {
                "VPHM"
            } else {
                "IPHM"
            }
        }
        SignalKind::Frequency => "FREQ",
        SignalKind::DfDt => "DFDT",
        SignalKind::Status => "FLAG",
        SignalKind::Digital => "DIGI",
        SignalKind::Analog => "ALOG",
        SignalKind::Calculation => "CALC",
        SignalKind::Statistic => "STAT",
        SignalKind::Alarm => "ALRM",
        SignalKind::Quality => "QUAL",
        SignalKind::Unknown => "NULL",
    }
}

/// Engineering units associated with a signal-type acronym.
pub fn engineering_units(signal_type: &str) -> &'static str {
    if signal_type.eq_ignore_ascii_case("IPHM") {
        "Amps"
    } else if signal_type.eq_ignore_ascii_case("VPHM") {
        "Volts"
    } else if signal_type.eq_ignore_ascii_case("FREQ") {
        "Hz"
    } else if signal_type.to_uppercase().ends_with("PHA") {
        "Degrees"
    } else {
        ""
    }
}

/// Classifies a protocol by name: measurement-oriented protocols versus
/// frame-oriented ones.
pub fn protocol_type(protocol_name: &str) -> &'static str {
    if protocol_name.starts_with("Gateway")
        || protocol_name.starts_with("Modbus")
        || protocol_name.starts_with("DNP")
    {
        "Measurement"
    } else {
        "Frame"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indexed_angle() {
        let reference: SignalReference = "CORDOVA-PA2".parse().unwrap();
        assert_eq!(reference.acronym, "CORDOVA");
        assert_eq!(reference.kind, SignalKind::Angle);
        assert_eq!(reference.index, 2);
        assert_eq!(reference.to_string(), "CORDOVA-PA2");
    }

    #[test]
    fn test_parse_frequency_without_index() {
        let reference: SignalReference = "SHELBY-FQ".parse().unwrap();
        assert_eq!(reference.acronym, "SHELBY");
        assert_eq!(reference.kind, SignalKind::Frequency);
        assert_eq!(reference.index, 0);
        assert_eq!(reference.to_string(), "SHELBY-FQ");
    }

    #[test]
    fn test_parse_uses_last_dash() {
        let reference: SignalReference = "EAST-SUB1-PM3".parse().unwrap();
        assert_eq!(reference.acronym, "EAST-SUB1");
        assert_eq!(reference.kind, SignalKind::Magnitude);
        assert_eq!(reference.index, 3);
    }

    #[test]
    fn test_parse_without_dash_is_unknown() {
        let reference: SignalReference = "shelby".parse().unwrap();
        assert_eq!(reference.acronym, "SHELBY");
        assert_eq!(reference.kind, SignalKind::Unknown);
        assert_eq!(reference.index, 0);
    }

    #[test]
    fn test_kind_acronym_roundtrip() {
        for kind in [
            SignalKind::Angle,
            SignalKind::Magnitude,
            SignalKind::Frequency,
            SignalKind::DfDt,
            SignalKind::Status,
            SignalKind::Digital,
            SignalKind::Analog,
            SignalKind::Calculation,
            SignalKind::Statistic,
            SignalKind::Alarm,
            SignalKind::Quality,
        ] {
            assert_eq!(SignalKind::parse_acronym(kind.acronym()), kind);
        }
        assert_eq!(SignalKind::parse_acronym("ZZ"), SignalKind::Unknown);
    }

    #[test]
    fn test_measurement_key_parse() {
        let key = MeasurementKey::parse("PPA:1234");
        assert_eq!(key.source, "PPA");
        assert_eq!(key.id, 1234);
        assert_eq!(key.to_string(), "PPA:1234");

        let key = MeasurementKey::parse("PPA");
        assert_eq!(key.source, "PPA");
        assert_eq!(key.id, u32::MAX);
    }

    #[test]
    fn test_signal_type_acronyms() {
        assert_eq!(signal_type_acronym(SignalKind::Angle, 'V'), "VPHA");
        assert_eq!(signal_type_acronym(SignalKind::Angle, 'I'), "IPHA");
        assert_eq!(signal_type_acronym(SignalKind::Magnitude, 'v'), "VPHM");
        assert_eq!(signal_type_acronym(SignalKind::Magnitude, 'I'), "IPHM");
        assert_eq!(signal_type_acronym(SignalKind::Frequency, 'V'), "FREQ");
        assert_eq!(signal_type_acronym(SignalKind::Unknown, 'V'), "NULL");
    }

    #[test]
    fn test_engineering_units() {
        assert_eq!(engineering_units("IPHM"), "Amps");
        assert_eq!(engineering_units("VPHM"), "Volts");
        assert_eq!(engineering_units("FREQ"), "Hz");
        assert_eq!(engineering_units("VPHA"), "Degrees");
        assert_eq!(engineering_units("IPHA"), "Degrees");
        assert_eq!(engineering_units("FLAG"), "");
    }

    #[test]
    fn test_protocol_classification() {
        assert_eq!(protocol_type("Gateway Transport"), "Measurement");
        assert_eq!(protocol_type("Modbus"), "Measurement");
        assert_eq!(protocol_type("DNP3"), "Measurement");
        assert_eq!(protocol_type("IEEE C37.118-2005"), "Frame");
    }
}
