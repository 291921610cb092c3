//! Typed ID definitions for the load-testing domain.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

define_id!(RunId, "run");
define_id!(StepId, "step");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_run_id_prefix() {
        let id = RunId::new();
        let s = id.to_string();
        assert!(s.starts_with("run_"));
    }

    #[test]
    fn test_step_id_rejects_run_prefix() {
        let result: Result<StepId, _> = "run_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_run_id_missing_separator() {
        let result: Result<RunId, _> = "run01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_run_id_empty() {
        let result: Result<RunId, _> = "".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_run_id_invalid_ulid() {
        let result: Result<RunId, _> = "run_invalid".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_step_id_json_roundtrip() {
        let id = StepId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: StepId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_run_ids_sort_by_creation_time() {
        let a = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::new();
        assert!(a < b);
    }

    proptest::proptest! {
        #[test]
        fn prop_step_id_string_roundtrip(ms in 0u64..(1u64 << 47)) {
            let id = StepId::from_ulid(crate::Ulid::from_parts(ms, 42));
            let parsed = StepId::parse(&id.to_string()).unwrap();
            proptest::prop_assert_eq!(id, parsed);
        }
    }
}
