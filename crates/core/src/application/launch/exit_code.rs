// Exit codes - final exit status to process exit code

use std::collections::HashMap;

use crate::domain::exit_codes;

/// No job name was given on the command line
pub const JOB_NOT_PROVIDED: &str = "JOB_NOT_PROVIDED";
/// The named job is not registered
pub const NO_SUCH_JOB: &str = "NO_SUCH_JOB";

pub const EXIT_CODE_COMPLETED: i32 = 0;
pub const EXIT_CODE_GENERIC_ERROR: i32 = 1;
pub const EXIT_CODE_JOB_ERROR: i32 = 2;

pub trait ExitCodeMapper: Send + Sync {
    fn int_value(&self, exit_code: &str) -> i32;
}

#[derive(Debug, Clone)]
pub struct SimpleExitCodeMapper {
    mapping: HashMap<String, i32>,
}

impl SimpleExitCodeMapper {
    pub fn new() -> Self {
        let mapping = HashMap::from([
            (exit_codes::COMPLETED.to_string(), EXIT_CODE_COMPLETED),
            (exit_codes::FAILED.to_string(), EXIT_CODE_GENERIC_ERROR),
            (JOB_NOT_PROVIDED.to_string(), EXIT_CODE_JOB_ERROR),
            (NO_SUCH_JOB.to_string(), EXIT_CODE_JOB_ERROR),
        ]);
        Self { mapping }
    }

    pub fn with_mapping(mut self, exit_code: impl Into<String>, value: i32) -> Self {
        self.mapping.insert(exit_code.into(), value);
        self
    }
}

impl Default for SimpleExitCodeMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitCodeMapper for SimpleExitCodeMapper {
    fn int_value(&self, exit_code: &str) -> i32 {
        self.mapping
            .get(exit_code)
            .copied()
            .unwrap_or(EXIT_CODE_GENERIC_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping() {
        let mapper = SimpleExitCodeMapper::new();
        assert_eq!(mapper.int_value("COMPLETED"), 0);
        assert_eq!(mapper.int_value("FAILED"), 1);
        assert_eq!(mapper.int_value(NO_SUCH_JOB), 2);
        assert_eq!(mapper.int_value(JOB_NOT_PROVIDED), 2);
        assert_eq!(mapper.int_value("STOPPED"), 1);
        assert_eq!(mapper.int_value("COMPLETED WITH SKIPS"), 1);
    }

    #[test]
    fn test_custom_mapping() {
        let mapper = SimpleExitCodeMapper::new().with_mapping("COMPLETED WITH SKIPS", 3);
        assert_eq!(mapper.int_value("COMPLETED WITH SKIPS"), 3);
        assert_eq!(mapper.int_value("COMPLETED"), 0);
    }
}
