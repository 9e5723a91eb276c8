// Job Parameters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::error::{DomainError, Result};

/// Typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "STRING",
            ParameterValue::Long(_) => "LONG",
            ParameterValue::Double(_) => "DOUBLE",
            ParameterValue::Date(_) => "DATE",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::Long(v) => write!(f, "{}", v),
            ParameterValue::Double(v) => write!(f, "{}", v),
            ParameterValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

impl JobParameter {
    pub fn identifying(value: ParameterValue) -> Self {
        Self {
            value,
            identifying: true,
        }
    }

    pub fn non_identifying(value: ParameterValue) -> Self {
        Self {
            value,
            identifying: false,
        }
    }
}

/// Named, typed parameters of a job run, kept in name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.parameters.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.parameters.get(name).map(|p| &p.value) {
            Some(ParameterValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.parameters.get(name).map(|p| &p.value) {
            Some(ParameterValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.parameters.get(name).map(|p| &p.value) {
            Some(ParameterValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.parameters.get(name).map(|p| &p.value) {
            Some(ParameterValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters.iter()
    }

    /// Only the parameters that take part in instance identity.
    pub fn identifying_parameters(&self) -> JobParameters {
        JobParameters {
            parameters: self
                .parameters
                .iter()
                .filter(|(_, p)| p.identifying)
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Canonical identity key built from the identifying parameters.
    ///
    /// Two parameter sets that differ only in non-identifying entries yield
    /// the same key, and therefore the same job instance.
    pub fn identity_key(&self) -> String {
        self.parameters
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(name, p)| format!("{}={}:{}", name, p.value.type_name(), p.value))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parse command-line style `name(type)=value` pairs.
    ///
    /// Supported types are `string` (default), `long`, `double` and `date`
    /// (RFC 3339). A leading `-` marks the parameter as non-identifying.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<JobParameters> {
        let mut builder = JobParametersBuilder::new();
        for arg in args {
            let arg = arg.as_ref().trim();
            let (key, raw) = arg.split_once('=').ok_or_else(|| {
                DomainError::InvalidParameter(format!("expected name=value, got '{}'", arg))
            })?;

            let (key, identifying) = match key.strip_prefix('-') {
                Some(stripped) => (stripped, false),
                None => (key, true),
            };

            let (name, type_name) = match key.split_once('(') {
                Some((name, rest)) => {
                    let type_name = rest.strip_suffix(')').ok_or_else(|| {
                        DomainError::InvalidParameter(format!("unterminated type in '{}'", key))
                    })?;
                    (name, type_name.to_ascii_lowercase())
                }
                None => (key, "string".to_string()),
            };

            if name.is_empty() {
                return Err(DomainError::InvalidParameter(format!(
                    "empty parameter name in '{}'",
                    arg
                )));
            }

            let value = match type_name.as_str() {
                "string" => ParameterValue::String(raw.to_string()),
                "long" => ParameterValue::Long(raw.parse().map_err(|_| {
                    DomainError::InvalidParameter(format!("'{}' is not a long", raw))
                })?),
                "double" => ParameterValue::Double(raw.parse().map_err(|_| {
                    DomainError::InvalidParameter(format!("'{}' is not a double", raw))
                })?),
                "date" => ParameterValue::Date(
                    DateTime::parse_from_rfc3339(raw)
                        .map_err(|_| {
                            DomainError::InvalidParameter(format!("'{}' is not an RFC 3339 date", raw))
                        })?
                        .with_timezone(&Utc),
                ),
                other => {
                    return Err(DomainError::InvalidParameter(format!(
                        "unknown parameter type '{}'",
                        other
                    )))
                }
            };

            builder = builder.add_parameter(
                name,
                JobParameter {
                    value,
                    identifying,
                },
            );
        }
        Ok(builder.build())
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, p)| {
                let prefix = if p.identifying { "" } else { "-" };
                format!("{}{}={}", prefix, name, p.value)
            })
            .collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

/// Fluent builder for [`JobParameters`].
#[derive(Debug, Clone, Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters(parameters: &JobParameters) -> Self {
        Self {
            parameters: parameters.parameters.clone(),
        }
    }

    pub fn add_parameter(mut self, name: impl Into<String>, parameter: JobParameter) -> Self {
        self.parameters.insert(name.into(), parameter);
        self
    }

    pub fn add_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_parameter(name, JobParameter::identifying(ParameterValue::String(value.into())))
    }

    pub fn add_long(self, name: impl Into<String>, value: i64) -> Self {
        self.add_parameter(name, JobParameter::identifying(ParameterValue::Long(value)))
    }

    pub fn add_double(self, name: impl Into<String>, value: f64) -> Self {
        self.add_parameter(name, JobParameter::identifying(ParameterValue::Double(value)))
    }

    pub fn add_date(self, name: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.add_parameter(name, JobParameter::identifying(ParameterValue::Date(value)))
    }

    pub fn add_non_identifying(self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.add_parameter(name, JobParameter::non_identifying(value))
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ignores_non_identifying() {
        let a = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_non_identifying("run.note", ParameterValue::String("first".into()))
            .build();
        let b = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_non_identifying("run.note", ParameterValue::String("second".into()))
            .build();

        assert_eq!(a.identity_key(), b.identity_key());
        assert_ne!(a, b);
        assert_eq!(a.identifying_parameters().len(), 1);
    }

    #[test]
    fn test_parse_typed_arguments() {
        let params = JobParameters::parse(&[
            "input=data.csv",
            "count(long)=5",
            "ratio(double)=0.5",
            "day(date)=2024-01-01T00:00:00Z",
            "-attempt(long)=2",
        ])
        .unwrap();

        assert_eq!(params.get_string("input"), Some("data.csv"));
        assert_eq!(params.get_long("count"), Some(5));
        assert_eq!(params.get_double("ratio"), Some(0.5));
        assert!(params.get_date("day").is_some());
        assert!(!params.get("attempt").unwrap().identifying);
        assert!(!params.identity_key().contains("attempt"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(JobParameters::parse(&["novalue"]).is_err());
        assert!(JobParameters::parse(&["n(long)=abc"]).is_err());
        assert!(JobParameters::parse(&["n(blob)=1"]).is_err());
        assert!(JobParameters::parse(&["(long)=1"]).is_err());
    }
}
