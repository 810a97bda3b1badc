use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, Secret};
use crate::cli::{AuthArgs, DownloadArgs};
use crate::download::DownloadConfig;
use crate::retry::RetryConfig;

/// Contents of `settings.json`.
#[derive(Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gmail: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub android_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_token: Option<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("gmail", &self.gmail)
            .field("password", &"<redacted>")
            .field("android_id", &self.android_id)
            .field("master_token", &self.master_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Settings {
    fn template() -> Self {
        Self {
            gmail: "alias@gmail.com".into(),
            password: String::new(),
            android_id: "0000000000000000".into(),
            master_token: None,
        }
    }
}

/// Read `path`, or write a template there and fail so the user can fill it in.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let template = serde_json::to_string_pretty(&Settings::template())?;
            std::fs::write(path, template + "\n")
                .with_context(|| format!("Failed to write settings template {}", path.display()))?;
            anyhow::bail!(
                "Settings file {} not found. A template was written there; fill in \
                 gmail, password and android_id and run again.",
                path.display()
            )
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// Android IDs are 64-bit values written as (up to) 16 hex digits.
fn validate_device_id(id: &str) -> anyhow::Result<()> {
    if id.is_empty() || id.len() > 16 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!(
            "Device id '{}' is not an Android ID (up to 16 hex digits)",
            id
        );
    }
    Ok(())
}

/// Settings for talking to the backup API.
pub struct Config {
    pub credentials: Credentials,
    pub retry: RetryConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials redacts its own secret.
        f.debug_struct("Config")
            .field("credentials", &self.credentials)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Config {
    /// Resolve credentials from CLI flags and environment, falling back to
    /// the settings file for anything not given there.
    pub fn from_auth_args<F>(args: &AuthArgs, password_provider: F) -> anyhow::Result<Self>
    where
        F: Fn() -> Option<String>,
    {
        let account = non_empty(args.account.as_deref());
        let device_id = non_empty(args.device_id.as_deref());
        let cli_secret = non_empty(args.master_token.as_deref())
            .map(Secret::MasterToken)
            .or_else(|| non_empty(args.password.as_deref()).map(Secret::Password));

        let settings = if account.is_some() && device_id.is_some() && cli_secret.is_some() {
            Settings::default()
        } else {
            load_settings(&expand_tilde(&args.settings))?
        };

        let account = account
            .or_else(|| non_empty(Some(settings.gmail.as_str())))
            .context("No Google account given (--account, WA_BACKUP_ACCOUNT or `gmail` in settings)")?;
        let device_id = device_id
            .or_else(|| non_empty(Some(settings.android_id.as_str())))
            .context("No Android ID given (--device-id, WA_BACKUP_DEVICE_ID or `android_id` in settings)")?;
        validate_device_id(&device_id)?;

        let secret = match cli_secret {
            Some(secret) => secret,
            None => non_empty(settings.master_token.as_deref())
                .map(Secret::MasterToken)
                .or_else(|| non_empty(Some(settings.password.as_str())).map(Secret::Password))
                .or_else(|| password_provider().map(Secret::Password))
                .context("No password or master token given")?,
        };

        Ok(Self {
            credentials: Credentials {
                account,
                secret,
                device_id,
            },
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: Duration::from_secs(args.retry_delay),
                max_delay: Duration::from_secs(args.retry_max_delay),
            },
        })
    }
}

/// Engine settings for a `download` invocation.
pub fn download_config(args: &DownloadArgs, retry: RetryConfig) -> DownloadConfig {
    DownloadConfig {
        directory: expand_tilde(&args.directory),
        concurrency: usize::from(args.concurrency),
        max_attempts: args.max_attempts,
        retry,
        throttle_pause: Duration::from_secs(args.throttle_pause),
        checkpoint_bytes: args.checkpoint_mib * 1024 * 1024,
        no_progress_bar: args.no_progress_bar,
        dry_run: args.dry_run,
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::{Cli, Command};

    fn auth_args(extra: &[&str]) -> AuthArgs {
        let mut argv = vec!["wabackup-rs", "info"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Info(args) => args.auth,
            _ => unreachable!(),
        }
    }

    fn write_settings(dir: &Path, json: &str) -> String {
        let path = dir.join("settings.json");
        std::fs::write(&path, json).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_missing_settings_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let err = load_settings(&path).unwrap_err();
        assert!(err.to_string().contains("template"));

        let written: Settings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.gmail, "alias@gmail.com");
        assert_eq!(written.android_id, "0000000000000000");
        assert!(written.password.is_empty());
    }

    #[test]
    fn test_untouched_template_password_falls_through_to_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert!(load_settings(&path).is_err());

        let mut template: Settings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        template.gmail = "me@gmail.com".into();
        template.android_id = "abcdef0123456789".into();
        std::fs::write(&path, serde_json::to_string(&template).unwrap()).unwrap();

        let args = auth_args(&["--settings", &path.to_string_lossy()]);
        let cfg = Config::from_auth_args(&args, || Some("typed".into())).unwrap();
        assert!(matches!(cfg.credentials.secret, Secret::Password(ref p) if p == "typed"));
    }

    #[test]
    fn test_settings_file_supplies_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_settings(
            dir.path(),
            r#"{"gmail": "me@gmail.com", "password": "hunter2", "android_id": "abcdef0123456789"}"#,
        );
        let cfg = Config::from_auth_args(&auth_args(&["--settings", &settings]), || None).unwrap();
        assert_eq!(cfg.credentials.account, "me@gmail.com");
        assert_eq!(cfg.credentials.device_id, "abcdef0123456789");
        assert!(matches!(cfg.credentials.secret, Secret::Password(ref p) if p == "hunter2"));
        assert_eq!(cfg.retry.max_retries, 4);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_retry_flags_shape_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_settings(
            dir.path(),
            r#"{"gmail": "me@gmail.com", "password": "hunter2", "android_id": "abcdef0123456789"}"#,
        );
        let args = auth_args(&[
            "--settings",
            &settings,
            "--max-retries",
            "7",
            "--retry-delay",
            "3",
            "--retry-max-delay",
            "10",
        ]);
        let cfg = Config::from_auth_args(&args, || None).unwrap();
        assert_eq!(cfg.retry.max_retries, 7);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(3));
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_settings(
            dir.path(),
            r#"{"gmail": "me@gmail.com", "password": "hunter2", "android_id": "abcdef0123456789"}"#,
        );
        let args = auth_args(&[
            "--settings",
            &settings,
            "--account",
            "other@gmail.com",
            "--master-token",
            "aas_et/xyz",
        ]);
        let cfg = Config::from_auth_args(&args, || None).unwrap();
        assert_eq!(cfg.credentials.account, "other@gmail.com");
        assert_eq!(cfg.credentials.device_id, "abcdef0123456789");
        assert!(matches!(cfg.credentials.secret, Secret::MasterToken(ref t) if t == "aas_et/xyz"));
    }

    #[test]
    fn test_full_cli_credentials_skip_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json").to_string_lossy().into_owned();
        let args = auth_args(&[
            "--settings",
            &missing,
            "--account",
            "me@gmail.com",
            "--password",
            "pw",
            "--device-id",
            "0123456789abcdef",
        ]);
        assert!(Config::from_auth_args(&args, || None).is_ok());
        assert!(!dir.path().join("nope.json").exists());
    }

    #[test]
    fn test_password_prompt_used_last() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_settings(
            dir.path(),
            r#"{"gmail": "me@gmail.com", "android_id": "abcdef0123456789"}"#,
        );
        let args = auth_args(&["--settings", &settings]);
        let cfg = Config::from_auth_args(&args, || Some("typed".into())).unwrap();
        assert!(matches!(cfg.credentials.secret, Secret::Password(ref p) if p == "typed"));
        assert!(Config::from_auth_args(&args, || None).is_err());
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        assert!(validate_device_id("0123456789abcdef").is_ok());
        assert!(validate_device_id("xyz").is_err());
        assert!(validate_device_id("0123456789abcdef0").is_err());
        assert!(validate_device_id("").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let settings = Settings {
            password: "hunter2".into(),
            master_token: Some("aas_et/secret".into()),
            ..Settings::template()
        };
        let dbg = format!("{:?}", settings);
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("aas_et"));
    }

    #[test]
    fn test_download_config_from_args() {
        let cli = Cli::try_parse_from([
            "wabackup-rs",
            "download",
            "-d",
            "/backups",
            "--concurrency",
            "8",
            "--checkpoint-mib",
            "2",
            "--dry-run",
        ])
        .unwrap();
        let Command::Download(args) = cli.command else {
            unreachable!()
        };
        let cfg = download_config(&args, RetryConfig::default());
        assert_eq!(cfg.directory, PathBuf::from("/backups"));
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.checkpoint_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.throttle_pause, Duration::from_secs(5));
        assert!(cfg.dry_run);
    }
}
