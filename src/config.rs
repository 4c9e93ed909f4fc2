//! User application configuration.
//!
//! A configuration is a named collection of sections, each holding typed,
//! constrained parameters. Setting a value validates it against the parameter
//! type and then against the constraints; invalid writes leave the previous
//! value in place. Configurations round-trip through a human-readable file
//! with one bracketed heading per section and one `key = value` line per
//! parameter, values encoded as JSON scalars. Unknown sections and keys found
//! at load time are warned and ignored, so that a stale file never poisons a
//! freshly-defaulted configuration.

use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use log::{error, info, warn};

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer number.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// Free-form (or choice-constrained) string.
    String(String),
}

impl ParameterValue {
    /// The name of the underlying primitive type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "int",
            ParameterValue::Float(_) => "float",
            ParameterValue::String(_) => "str",
        }
    }

    fn to_json(&self) -> String {
        match self {
            ParameterValue::Bool(value) => value.to_string(),
            ParameterValue::Int(value) => value.to_string(),
            // serde_json keeps the decimal point, so that floats survive the
            // round trip as floats.
            ParameterValue::Float(value) => serde_json::to_string(value).unwrap_or_default(),
            ParameterValue::String(value) => {
                serde_json::to_string(value).unwrap_or_else(|_| value.clone())
            }
        }
    }

    fn from_json(text: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Bool(value)) => ParameterValue::Bool(value),
            Ok(serde_json::Value::Number(number)) => match number.as_i64() {
                Some(value) => ParameterValue::Int(value),
                None => ParameterValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Ok(serde_json::Value::String(value)) => ParameterValue::String(value),
            // Bare identifiers are taken verbatim as strings.
            _ => ParameterValue::String(text.to_string()),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(value) => write!(f, "{value}"),
            ParameterValue::Int(value) => write!(f, "{value}"),
            ParameterValue::Float(value) => write!(f, "{value}"),
            ParameterValue::String(value) => write!(f, "{value}"),
        }
    }
}

/// Error that may occur while validating a parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterError {
    /// The value type does not match the parameter type.
    InvalidType {
        /// The parameter type.
        expected: &'static str,
        /// The type of the value being set.
        actual: &'static str,
    },
    /// The value is below the allowed minimum.
    NumberTooSmall,
    /// The value is above the allowed maximum.
    NumberTooLarge,
    /// The value is not among the allowed choices.
    InvalidChoice,
    /// The value is not on the allowed step grid.
    InvalidStep,
    /// The parameter does not exist.
    UnknownParameter(String),
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterError::InvalidType { expected, actual } => {
                write!(f, "invalid type ({actual}, expected {expected})")
            }
            ParameterError::NumberTooSmall => write!(f, "number too small"),
            ParameterError::NumberTooLarge => write!(f, "number too large"),
            ParameterError::InvalidChoice => write!(f, "invalid choice"),
            ParameterError::InvalidStep => write!(f, "invalid step"),
            ParameterError::UnknownParameter(name) => write!(f, "unknown parameter \"{name}\""),
        }
    }
}

impl error::Error for ParameterError {}

/// Constraints for integer parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntConstraints {
    /// The allowed choices.
    pub choices: Option<Vec<i64>>,
    /// The allowed step, relative to the minimum (or zero).
    pub step: Option<i64>,
    /// The minimum allowed value.
    pub min: Option<i64>,
    /// The maximum allowed value.
    pub max: Option<i64>,
}

/// Constraints for floating-point parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatConstraints {
    /// The minimum allowed value.
    pub min: Option<f64>,
    /// The maximum allowed value.
    pub max: Option<f64>,
}

/// Constraints for string parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringConstraints {
    /// The allowed choices.
    pub choices: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Constraints {
    None,
    Int(IntConstraints),
    Float(FloatConstraints),
    String(StringConstraints),
}

impl Constraints {
    fn is_none(&self) -> bool {
        matches!(self, Constraints::None)
    }
}

/// A single configuration parameter: name, typed value, human-readable
/// intent, optional units and display format, and constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: ParameterValue,
    intent: String,
    units: Option<String>,
    format: Option<String>,
    constraints: Constraints,
}

impl Parameter {
    fn new(name: &str, value: ParameterValue, intent: &str) -> Self {
        Self {
            name: name.to_string(),
            value,
            intent: intent.to_string(),
            units: None,
            format: None,
            constraints: Constraints::None,
        }
    }

    /// Create a boolean parameter.
    pub fn bool(name: &str, value: bool, intent: &str) -> Self {
        Self::new(name, ParameterValue::Bool(value), intent)
    }

    /// Create an integer parameter.
    pub fn int(name: &str, value: i64, intent: &str) -> Self {
        Self::new(name, ParameterValue::Int(value), intent)
    }

    /// Create a floating-point parameter.
    pub fn float(name: &str, value: f64, intent: &str) -> Self {
        Self::new(name, ParameterValue::Float(value), intent)
    }

    /// Create a string parameter.
    pub fn string(name: &str, value: &str, intent: &str) -> Self {
        Self::new(name, ParameterValue::String(value.to_string()), intent)
    }

    /// Attach measurement units (purely descriptive).
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Attach a display format hint (purely descriptive).
    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    fn set_constraints(mut self, expected: &'static str, constraints: Constraints) -> Self {
        if self.value.type_name() != expected {
            warn!(
                "Removing invalid constraint spec for {} ({})...",
                self.name,
                self.value.type_name()
            );
            return self;
        }
        self.constraints = constraints;
        self
    }

    /// Constrain an integer parameter. Ignored (with a warning) on any other
    /// parameter type.
    pub fn with_int_constraints(self, constraints: IntConstraints) -> Self {
        self.set_constraints("int", Constraints::Int(constraints))
    }

    /// Constrain a floating-point parameter. Ignored (with a warning) on any
    /// other parameter type.
    pub fn with_float_constraints(self, constraints: FloatConstraints) -> Self {
        self.set_constraints("float", Constraints::Float(constraints))
    }

    /// Constrain a string parameter to a set of choices. Ignored (with a
    /// warning) on any other parameter type.
    pub fn with_string_choices(self, choices: Vec<String>) -> Self {
        self.set_constraints(
            "str",
            Constraints::String(StringConstraints {
                choices: Some(choices),
            }),
        )
    }

    /// The parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current value.
    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    /// The human-readable intent.
    pub fn intent(&self) -> &str {
        &self.intent
    }

    /// The measurement units, if any.
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    fn check_int(constraints: &IntConstraints, value: i64) -> Result<(), ParameterError> {
        // The choice check runs first, so that inconsistent specs fail in a
        // predictable order.
        if let Some(choices) = &constraints.choices {
            if !choices.contains(&value) {
                return Err(ParameterError::InvalidChoice);
            }
        }
        if let Some(min) = constraints.min {
            if value < min {
                return Err(ParameterError::NumberTooSmall);
            }
        }
        if let Some(max) = constraints.max {
            if value > max {
                return Err(ParameterError::NumberTooLarge);
            }
        }
        if let Some(step) = constraints.step {
            let delta = value - constraints.min.unwrap_or(0);
            if delta % step != 0 {
                return Err(ParameterError::InvalidStep);
            }
        }
        Ok(())
    }

    fn check_float(constraints: &FloatConstraints, value: f64) -> Result<(), ParameterError> {
        if let Some(min) = constraints.min {
            if value < min {
                return Err(ParameterError::NumberTooSmall);
            }
        }
        if let Some(max) = constraints.max {
            if value > max {
                return Err(ParameterError::NumberTooLarge);
            }
        }
        Ok(())
    }

    fn check_string(constraints: &StringConstraints, value: &str) -> Result<(), ParameterError> {
        if let Some(choices) = &constraints.choices {
            if !choices.iter().any(|choice| choice == value) {
                return Err(ParameterError::InvalidChoice);
            }
        }
        Ok(())
    }

    fn validate(&self, value: &ParameterValue) -> Result<(), ParameterError> {
        if value.type_name() != self.value.type_name() {
            return Err(ParameterError::InvalidType {
                expected: self.value.type_name(),
                actual: value.type_name(),
            });
        }
        match (&self.constraints, value) {
            (Constraints::Int(constraints), ParameterValue::Int(value)) => {
                Self::check_int(constraints, *value)
            }
            (Constraints::Float(constraints), ParameterValue::Float(value)) => {
                Self::check_float(constraints, *value)
            }
            (Constraints::String(constraints), ParameterValue::String(value)) => {
                Self::check_string(constraints, value)
            }
            _ => Ok(()),
        }
    }

    /// Set the parameter value, validating it against the type and the
    /// constraints. Invalid writes leave the previous value in place.
    pub fn set_value(&mut self, value: ParameterValue) -> Result<(), ParameterError> {
        // Integers are happily promoted to floats, since the file encoding
        // cannot force a decimal point on the operator.
        let value = match (&self.value, value) {
            (ParameterValue::Float(_), ParameterValue::Int(raw)) => {
                ParameterValue::Float(raw as f64)
            }
            (_, value) => value,
        };
        if let Err(err) = self.validate(&value) {
            error!("Invalid setting ({value}) for {}: {err}", self.name);
            error!("Parameter value will not be set");
            return Err(err);
        }
        self.value = value;
        Ok(())
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.<20}: {}", self.name, self.value)?;
        if let Some(units) = &self.units {
            write!(f, " {units}")?;
        }
        if !self.constraints.is_none() {
            write!(f, " {:?}", self.constraints)?;
        }
        Ok(())
    }
}

/// A named, ordered collection of parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationSection {
    name: String,
    parameters: Vec<Parameter>,
}

impl ConfigurationSection {
    /// Create an empty section.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
        }
    }

    /// The section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a parameter to the section.
    pub fn add_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// The parameters, in declaration order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Set the value of a parameter.
    pub fn set_value(&mut self, name: &str, value: ParameterValue) -> Result<(), ParameterError> {
        match self.parameter_mut(name) {
            Some(parameter) => parameter.set_value(value),
            None => Err(ParameterError::UnknownParameter(name.to_string())),
        }
    }

    /// The value of a parameter, if it exists.
    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.parameter(name).map(Parameter::value)
    }
}

/// A configuration: a titled, ordered collection of sections.
///
/// Configurations are always created in place with all the parameters set to
/// their default values and then updated from a file, so that the
/// configuration is valid at all times and robust against schema updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    title: String,
    sections: Vec<ConfigurationSection>,
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            sections: Vec::new(),
        }
    }

    /// The configuration title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Add a section.
    pub fn add_section(mut self, section: ConfigurationSection) -> Self {
        self.sections.push(section);
        self
    }

    /// The sections, in declaration order.
    pub fn sections(&self) -> &[ConfigurationSection] {
        &self.sections
    }

    /// Look up a section by name.
    pub fn section(&self, name: &str) -> Option<&ConfigurationSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Look up a section by name, mutably.
    pub fn section_mut(&mut self, name: &str) -> Option<&mut ConfigurationSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    /// The value of a parameter, if the section and the parameter exist.
    pub fn value(&self, section: &str, name: &str) -> Option<&ParameterValue> {
        self.section(section).and_then(|s| s.value(name))
    }

    /// Update the value of a parameter.
    pub fn update_value(
        &mut self,
        section: &str,
        name: &str,
        value: ParameterValue,
    ) -> Result<(), ParameterError> {
        match self.section_mut(section) {
            Some(section) => section.set_value(name, value),
            None => Err(ParameterError::UnknownParameter(format!(
                "{section}.{name}"
            ))),
        }
    }

    /// Dump the configuration to file.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        info!("Writing configuration to {}...", path.display());
        let mut text = format!("# {}\n", self.title);
        for section in &self.sections {
            text.push_str(&format!("\n[{}]\n", section.name));
            for parameter in &section.parameters {
                match &parameter.units {
                    Some(units) => {
                        text.push_str(&format!("# {} [{}]\n", parameter.intent, units))
                    }
                    None => text.push_str(&format!("# {}\n", parameter.intent)),
                }
                text.push_str(&format!(
                    "{} = {}\n",
                    parameter.name,
                    parameter.value.to_json()
                ));
            }
        }
        fs::write(path, text)
    }

    /// Update the configuration parameters from file.
    ///
    /// Unknown sections and keys are warned and ignored; known keys with
    /// invalid values are warned and skipped, keeping the current value.
    pub fn update_from_file(&mut self, path: &Path) -> io::Result<()> {
        info!("Updating configuration from {}...", path.display());
        let text = fs::read_to_string(path)?;
        let mut current: Option<String> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if self.section(name).is_none() {
                    warn!("Unknown configuration section [{name}], skipping...");
                    current = None;
                } else {
                    current = Some(name.to_string());
                }
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                warn!("Malformed configuration line {line:?}, skipping...");
                continue;
            };
            let (key, raw) = (key.trim(), raw.trim());
            let Some(section_name) = &current else {
                continue;
            };
            let value = ParameterValue::from_json(raw);
            let section = match self.section_mut(section_name) {
                Some(section) => section,
                None => continue,
            };
            match section.set_value(key, value) {
                Ok(()) => {}
                Err(ParameterError::UnknownParameter(_)) => {
                    warn!("Unknown configuration key \"{key}\" in [{section_name}], skipping...");
                }
                Err(err) => {
                    warn!("Invalid value for \"{key}\" in [{section_name}] ({err}), skipping...");
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        for section in &self.sections {
            writeln!(f, "[{}]", section.name)?;
            for parameter in &section.parameters {
                writeln!(f, "{parameter}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_configuration() -> Configuration {
        Configuration::new("Sample application configuration").add_section(
            ConfigurationSection::new("source")
                .add_parameter(Parameter::bool("enable", true, "Enable the source"))
                .add_parameter(
                    Parameter::int("port", 20004, "TCP port").with_int_constraints(
                        IntConstraints {
                            min: Some(1024),
                            max: Some(65535),
                            ..Default::default()
                        },
                    ),
                )
                .add_parameter(
                    Parameter::float("timeout", 10., "Socket timeout")
                        .with_units("s")
                        .with_float_constraints(FloatConstraints {
                            min: Some(0.),
                            max: None,
                        }),
                )
                .add_parameter(
                    Parameter::string("mode", "auto", "Port discovery mode")
                        .with_string_choices(vec!["auto".into(), "manual".into()]),
                ),
        )
    }

    #[test]
    fn defaults() {
        let config = sample_configuration();
        assert_eq!(
            config.value("source", "port"),
            Some(&ParameterValue::Int(20004))
        );
        assert_eq!(
            config.value("source", "mode"),
            Some(&ParameterValue::String("auto".into()))
        );
    }

    #[test]
    fn type_mismatch_keeps_value() {
        let mut config = sample_configuration();
        let err = config
            .update_value("source", "port", ParameterValue::String("high".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ParameterError::InvalidType {
                expected: "int",
                actual: "str",
            }
        );
        assert_eq!(
            config.value("source", "port"),
            Some(&ParameterValue::Int(20004))
        );
    }

    #[test]
    fn range_constraints() {
        let mut config = sample_configuration();
        assert_eq!(
            config.update_value("source", "port", ParameterValue::Int(80)),
            Err(ParameterError::NumberTooSmall)
        );
        assert_eq!(
            config.update_value("source", "port", ParameterValue::Int(100_000)),
            Err(ParameterError::NumberTooLarge)
        );
        assert_eq!(
            config.update_value("source", "port", ParameterValue::Int(8080)),
            Ok(())
        );
        assert_eq!(
            config.update_value("source", "timeout", ParameterValue::Float(-1.)),
            Err(ParameterError::NumberTooSmall)
        );
    }

    #[test]
    fn step_constraint() {
        let mut config = Configuration::new("Test").add_section(
            ConfigurationSection::new("sampling").add_parameter(
                Parameter::int("interval", 100, "Sampling interval")
                    .with_int_constraints(IntConstraints {
                        min: Some(100),
                        max: Some(1000),
                        step: Some(50),
                        ..Default::default()
                    }),
            ),
        );
        assert_eq!(
            config.update_value("sampling", "interval", ParameterValue::Int(175)),
            Err(ParameterError::InvalidStep)
        );
        assert_eq!(
            config.update_value("sampling", "interval", ParameterValue::Int(250)),
            Ok(())
        );
    }

    #[test]
    fn choice_constraint() {
        let mut config = sample_configuration();
        assert_eq!(
            config.update_value("source", "mode", ParameterValue::String("magic".into())),
            Err(ParameterError::InvalidChoice)
        );
    }

    #[test]
    fn int_promoted_to_float() {
        let mut config = sample_configuration();
        config
            .update_value("source", "timeout", ParameterValue::Int(5))
            .unwrap();
        assert_eq!(
            config.value("source", "timeout"),
            Some(&ParameterValue::Float(5.))
        );
    }

    #[test]
    fn constraints_on_wrong_type_are_dropped() {
        let parameter = Parameter::bool("enable", true, "Enable").with_int_constraints(
            IntConstraints {
                min: Some(0),
                ..Default::default()
            },
        );
        assert!(parameter.constraints.is_none());
    }

    #[test]
    fn file_round_trip() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("sample.cfg");
        let mut config = sample_configuration();
        config
            .update_value("source", "port", ParameterValue::Int(8080))
            .unwrap();
        config
            .update_value("source", "mode", ParameterValue::String("manual".into()))
            .unwrap();
        config.write(&path).unwrap();
        let mut twin = sample_configuration();
        twin.update_from_file(&path).unwrap();
        assert_eq!(twin, config);
    }

    #[test]
    fn unknown_entries_are_skipped() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("stale.cfg");
        fs::write(
            &path,
            "[ghosts]\nrate = 1\n[source]\nport = 9090\nghost_key = 3\nport9000\n",
        )
        .unwrap();
        let mut config = sample_configuration();
        config.update_from_file(&path).unwrap();
        assert_eq!(
            config.value("source", "port"),
            Some(&ParameterValue::Int(9090))
        );
        assert_eq!(config.value("ghosts", "rate"), None);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("invalid.cfg");
        fs::write(&path, "[source]\nport = 80\nmode = \"magic\"\n").unwrap();
        let mut config = sample_configuration();
        config.update_from_file(&path).unwrap();
        assert_eq!(
            config.value("source", "port"),
            Some(&ParameterValue::Int(20004))
        );
        assert_eq!(
            config.value("source", "mode"),
            Some(&ParameterValue::String("auto".into()))
        );
    }
}
