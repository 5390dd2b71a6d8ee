//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify that boundary functions produce
//! expected outputs. Any change in behavior will cause these tests to fail,
//! signaling a wire-compatibility break with the remote peer.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

fn read_fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e))
}

// ============================================================================
// PATH NORMALIZATION GOLDEN TESTS
// ============================================================================

mod path_golden {
    use super::*;
    use treesync::types::{normalize_sync_path, PathError};

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        input: String,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok { ok: String },
        Err { err: String },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_path_normalization_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("path_normalization.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let result = normalize_sync_path(&case.input);

            match case.expected {
                Expected::Ok { ok } => {
                    assert_eq!(
                        result.as_deref(),
                        Ok(ok.as_str()),
                        "Case '{}': normalized value mismatch",
                        case.name
                    );
                }
                Expected::Err { err } => {
                    let actual_err = match result {
                        Err(PathError::Empty) => "Empty",
                        Err(PathError::TooLong) => "TooLong",
                        Err(PathError::Absolute) => "Absolute",
                        Err(PathError::Traversal) => "Traversal",
                        Err(PathError::InvalidChars) => "InvalidChars",
                        Ok(ref value) => panic!(
                            "Case '{}': expected Err({}), got Ok({:?})",
                            case.name, err, value
                        ),
                    };
                    assert_eq!(actual_err, err, "Case '{}': error type mismatch", case.name);
                }
            }
        }
    }
}

// ============================================================================
// SOURCE LABEL GOLDEN TESTS
// ============================================================================

mod source_golden {
    use super::*;
    use treesync::types::ChangeSource;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        input: Option<String>,
        expected: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_source_labels_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("source_labels.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let source = ChangeSource::from_label(case.input.as_deref());
            assert_eq!(
                source.as_str(),
                case.expected,
                "Case '{}': input={:?}",
                case.name,
                case.input
            );
        }
    }
}

// ============================================================================
// WIRE FORMAT GOLDEN TESTS
// ============================================================================

mod wire_golden {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use treesync::types::ChangeEvent;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        input: Value,
        expected: Option<Value>,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_wire_changes_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("wire_changes.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let parsed = serde_json::from_value::<ChangeEvent>(case.input);

            match case.expected {
                Some(expected) => {
                    let event = parsed
                        .unwrap_or_else(|e| panic!("Case '{}': rejected: {}", case.name, e));
                    let wire = serde_json::to_value(&event).unwrap();
                    assert_eq!(wire, expected, "Case '{}'", case.name);
                }
                None => assert!(
                    parsed.is_err(),
                    "Case '{}': expected rejection, got {:?}",
                    case.name,
                    parsed
                ),
            }
        }
    }
}
