//! Property-based tests for treesync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Path normalization never escapes the root and is idempotent
//! - Parsers never panic
//! - The journal stays bounded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// PATH NORMALIZATION TESTS
// ============================================================================

mod path_tests {
    use super::*;
    use treesync::types::{normalize_sync_path, PathError, MAX_PATH_LENGTH};

    proptest! {
        /// Invariant: normalize_sync_path never panics on any string input
        #[test]
        fn never_panics(s in ".*") {
            let _ = normalize_sync_path(&s);
        }

        /// Invariant: accepted paths are relative, slash-separated and free of
        /// parent or empty segments
        #[test]
        fn accepted_paths_stay_inside_root(s in "[a-z./\\\\]{1,40}") {
            if let Ok(normalized) = normalize_sync_path(&s) {
                prop_assert!(!normalized.starts_with('/'));
                prop_assert!(!normalized.contains('\\'));
                for segment in normalized.split('/') {
                    prop_assert!(!segment.is_empty());
                    prop_assert_ne!(segment, "..");
                    prop_assert_ne!(segment, ".");
                }
            }
        }

        /// Invariant: any `..` segment is rejected
        #[test]
        fn traversal_rejected(prefix in "[a-z]{0,8}", suffix in "[a-z]{0,8}") {
            let path = format!("{}/../{}", prefix, suffix);
            prop_assert_eq!(normalize_sync_path(&path), Err(PathError::Traversal));
        }

        /// Invariant: normalizing twice changes nothing
        #[test]
        fn idempotent(s in "[a-zA-Z0-9._:/\\\\-]{1,80}") {
            if let Ok(normalized) = normalize_sync_path(&s) {
                prop_assert_eq!(normalize_sync_path(&normalized), Ok(normalized.clone()));
            }
        }

        /// Invariant: accepted paths respect the length limit
        #[test]
        fn respects_max_length(s in "[a-z/]{1,200}") {
            if let Ok(normalized) = normalize_sync_path(&s) {
                prop_assert!(normalized.len() <= MAX_PATH_LENGTH);
            }
        }
    }
}

// ============================================================================
// INBOUND PARSING TESTS
// ============================================================================

mod inbound_tests {
    use super::*;
    use treesync::types::{FileOperation, InboundBatch};

    proptest! {
        /// Invariant: arbitrary bodies never panic the tolerant parser
        #[test]
        fn batch_parse_never_panics(body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let batch = InboundBatch::parse(&body);
            let _ = batch.is_recognized();
        }

        /// Invariant: unknown action labels are rejected, never guessed
        #[test]
        fn unknown_actions_rejected(action in "[a-z]{1,12}") {
            let op = FileOperation {
                path: "a.txt".to_string(),
                action: Some(action.clone()),
                ..Default::default()
            };
            let known = matches!(action.as_str(), "create" | "update" | "delete");
            prop_assert_eq!(op.parsed_action().is_ok(), known);
        }
    }
}

// ============================================================================
// CONTENT ENCODING TESTS
// ============================================================================

mod content_tests {
    use super::*;
    use treesync::types::{decode_content, encode_content, ContentEncoding};

    proptest! {
        /// Invariant: any byte sequence survives the wire unchanged
        #[test]
        fn bytes_survive_encoding(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let (text, encoding) = encode_content(&bytes);
            prop_assert_eq!(decode_content(&text, encoding).unwrap(), bytes.clone());
            if std::str::from_utf8(&bytes).is_err() {
                prop_assert_eq!(encoding, Some(ContentEncoding::Base64));
            }
        }
    }
}

// ============================================================================
// ECHO SUPPRESSION TESTS
// ============================================================================

mod echo_tests {
    use super::*;
    use std::time::Duration;
    use treesync::echo::EchoGuard;

    proptest! {
        /// Invariant: only the exact applied content counts as an echo
        #[test]
        fn echo_requires_matching_content(
            applied in proptest::collection::vec(any::<u8>(), 0..64),
            observed in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let guard = EchoGuard::new(Duration::from_secs(60));
            guard.mark_written("f.txt", &applied);
            prop_assert_eq!(guard.is_echo("f.txt", Some(observed.as_slice())), applied == observed);
            prop_assert!(!guard.is_echo("other.txt", Some(applied.as_slice())));
        }
    }
}

// ============================================================================
// JOURNAL BOUND TESTS
// ============================================================================

mod journal_tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use treesync::journal::{SyncJournal, SyncLogEntry};
    use treesync::types::ChangeSource;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Invariant: the journal never holds more than its capacity and
        /// always keeps the newest entries
        #[test]
        fn stays_bounded(capacity in 1usize..20, appends in 0usize..60) {
            let dir = TempDir::new().unwrap();
            let journal = SyncJournal::with_capacity(dir.path().join("log.json"), capacity);

            for i in 0..appends {
                journal
                    .append(SyncLogEntry::new("file_updated", ChangeSource::Local, json!({ "n": i })))
                    .unwrap();
            }

            let all = journal.all().unwrap();
            prop_assert_eq!(all.len(), appends.min(capacity));
            if let Some(last) = all.last() {
                prop_assert_eq!(last.data["n"].as_u64(), Some(appends as u64 - 1));
            }
            if let Some(first) = all.first() {
                prop_assert_eq!(
                    first.data["n"].as_u64(),
                    Some(appends.saturating_sub(capacity) as u64)
                );
            }
        }
    }
}
