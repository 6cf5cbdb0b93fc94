//! Tests for connection-string handling.

use super::*;
use std::sync::Arc;

mod parsing_tests {
    use super::*;

    #[test]
    fn test_parse_entries() {
        let entries =
            parse_connection_string("Data Source=orcl; User Id=scott ;Password='pa;ss';");

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, "Data Source");
        assert_eq!(entries[1].value, "scott");
        assert_eq!(entries[2].value, "pa;ss");
    }

    #[test]
    fn test_value_lookup_ignores_key_case() {
        let value = connection_string_value("data source=orcl;ENLIST=false", "Enlist");
        assert_eq!(value.as_deref(), Some("false"));
    }

    /// Verify the schema key is removed and the rest kept verbatim
    #[test]
    fn test_extract_schema_name() {
        let (connection_string, schema) =
            extract_schema_name("Data Source=orcl;Queue Schema=SALES;User Id=scott");

        assert_eq!(connection_string, "Data Source=orcl;User Id=scott");
        assert_eq!(schema.as_deref(), Some("SALES"));
    }

    #[test]
    fn test_extract_schema_name_absent() {
        let original = "Data Source=orcl;User Id=scott;";
        let (connection_string, schema) = extract_schema_name(original);

        assert_eq!(connection_string, original);
        assert_eq!(schema, None);
    }

    #[test]
    fn test_enlistment_detection() {
        assert!(connection_supports_enlistment("Data Source=orcl"));
        assert!(connection_supports_enlistment("Data Source=orcl;Enlist=true"));
        assert!(!connection_supports_enlistment("Data Source=orcl;enlist = FALSE"));
    }
}

mod params_tests {
    use super::*;

    #[test]
    fn test_specific_overrides_default() {
        let params = ConnectionParams::new(
            Some("Data Source=reporting"),
            Some("REPORTS"),
            "Data Source=orcl",
            Some("SALES"),
        )
        .unwrap();

        assert_eq!(params.connection_string(), "Data Source=reporting");
        assert_eq!(params.schema(), Some("REPORTS"));
    }

    /// Verify blank specific values fall back to defaults
    #[test]
    fn test_blank_specific_falls_back() {
        let params = ConnectionParams::new(Some("  "), None, "Data Source=orcl", Some("SALES"))
            .unwrap();

        assert_eq!(params.connection_string(), "Data Source=orcl");
        assert_eq!(params.schema(), Some("SALES"));
    }

    #[test]
    fn test_missing_connection_string_rejected() {
        let result = ConnectionParams::new(None, None, "", None);
        assert!(matches!(result, Err(ConfigurationError::Missing { .. })));
    }

    #[test]
    fn test_make_specific() {
        let defaults = ConnectionParams::new(None, None, "Data Source=orcl", Some("SALES")).unwrap();

        let schema_only = defaults.make_specific(None, Some("AUDIT"));
        assert_eq!(schema_only.connection_string(), "Data Source=orcl");
        assert_eq!(schema_only.schema(), Some("AUDIT"));

        let both = defaults.make_specific(Some("Data Source=dr"), None);
        assert_eq!(both.connection_string(), "Data Source=dr");
        assert_eq!(both.schema(), Some("SALES"));
    }
}

mod enlistment_cache_tests {
    use super::*;

    /// Verify each distinct connection string is computed once
    #[test]
    fn test_cache_memoises_per_connection_string() {
        let cache = EnlistmentCache::new();

        assert!(cache.can_enlist("Data Source=a"));
        assert!(!cache.can_enlist("Data Source=b;Enlist=false"));
        assert!(cache.can_enlist("Data Source=a"));

        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_shared_across_threads() {
        let cache = Arc::new(EnlistmentCache::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let connection_string = format!("Data Source=db{}", i % 2);
                    cache.can_enlist(&connection_string)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(cache.len(), 2);
    }
}
