use std::path::PathBuf;
use std::time::Duration;

use imaging_gateway::config::{Config, ConfigError, DicomWebAuth};

fn demo_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/standalone.toml")
}

#[test]
fn test_demo_config_loads() {
    let config = Config::from_file(demo_config_path()).expect("demo config should be valid");

    assert_eq!(config.gateway.id, "gateway-standalone");
    assert_eq!(config.storage.concurrent_uploads, 4);
    assert_eq!(config.storage.payload_timeout(), Duration::from_secs(5));
    assert_eq!(config.export.retries.delays(), vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4)
    ]);

    let pacs = &config.export.dicom.destinations["pacs"];
    assert_eq!(pacs.ae_title, "PACS");
    assert_eq!(pacs.port, 11112);

    assert_eq!(config.export.dicomweb.destinations["archive"].auth, None);
    assert_eq!(
        config.export.dicomweb.destinations["cloud"].auth,
        Some(DicomWebAuth::Bearer {
            token: "change-me".into()
        })
    );
    assert_eq!(config.export.hl7.destinations["ehr"].port, 2575);
    assert!(!config.export.external_app.enabled);

    // Unset topics keep their defaults
    assert_eq!(config.messaging.topics.export_hl7, "md.export.hl7");
    assert_eq!(config.messaging.topics.export_request("scu"), "md.export.request.scu");
}

#[test]
fn test_missing_file_is_io_error() {
    let result = Config::from_file("/nonexistent/gateway.toml");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_basic_auth_destination() {
    let toml = r#"
        [export.dicomweb.destinations.secure]
        uri = "https://pacs.example.org/dicomweb"
        auth = { type = "basic", username = "gateway", password = "secret" }
    "#;
    let config = Config::from_toml_str(toml).unwrap();
    assert_eq!(
        config.export.dicomweb.destinations["secure"].auth,
        Some(DicomWebAuth::Basic {
            username: "gateway".into(),
            password: "secret".into()
        })
    );
}

#[test]
fn test_unknown_auth_type_rejected() {
    let toml = r#"
        [export.dicomweb.destinations.secure]
        uri = "https://pacs.example.org/dicomweb"
        auth = { type = "oauth", token = "x" }
    "#;
    assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::Parse(_))));
}

#[test]
fn test_dicomweb_uri_must_be_http() {
    let toml = r#"
        [export.dicomweb.destinations.ftp]
        uri = "ftp://pacs.example.org/dicomweb"
    "#;
    let err = Config::from_toml_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidDestination { ref name, .. } if name == "ftp"));
}

#[test]
fn test_invalid_calling_ae_title_rejected() {
    let toml = r#"
        [export.dicom]
        ae_title = "THIS_AE_TITLE_IS_TOO_LONG"
    "#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_zero_concurrency_rejected_per_pipeline() {
    for section in ["dicom", "external_app"] {
        let toml = format!("[export.{}]\nmax_associations = 0\n", section);
        assert!(
            matches!(Config::from_toml_str(&toml), Err(ConfigError::ZeroWorkers(_))),
            "{} accepted zero workers",
            section
        );
    }
    for section in ["dicomweb", "hl7"] {
        let toml = format!("[export.{}]\nmax_connections = 0\n", section);
        assert!(
            matches!(Config::from_toml_str(&toml), Err(ConfigError::ZeroWorkers(_))),
            "{} accepted zero workers",
            section
        );
    }
}
