//! Credential resolution.
//!
//! Three mechanisms compose in a fixed precedence: an external
//! `auth_provider_cmd` whose stdout supplies credentials, direct IAM role
//! assumption, and the inherited process environment. The provider command
//! wins over role assumption; within the provider output, static
//! `awsCredentials` win over an `awsRole`. Derived credentials carry an
//! expiry and are refreshed before they lapse.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{IamAssume, UnitConfig};
use crate::error::{StratusError, StratusResult};

/// JSON contract of `auth_provider_cmd` stdout. Absent fields have no
/// effect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderCmdOutput {
    #[serde(rename = "awsCredentials")]
    pub aws_credentials: Option<AwsCredentials>,
    #[serde(rename = "awsRole")]
    pub aws_role: Option<AwsRole>,
    pub envs: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsCredentials {
    #[serde(rename = "ACCESS_KEY_ID")]
    pub access_key_id: String,
    #[serde(rename = "SECRET_ACCESS_KEY")]
    pub secret_access_key: String,
    #[serde(rename = "SESSION_TOKEN")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsRole {
    #[serde(rename = "roleARN")]
    pub role_arn: String,
    #[serde(rename = "roleSessionName")]
    pub session_name: Option<String>,
    pub duration: Option<u64>,
    #[serde(rename = "webIdentityToken")]
    pub web_identity_token: Option<String>,
}

/// Environment derived from one credential source, with its expiry.
#[derive(Debug, Clone)]
struct CredentialEnv {
    vars: Vec<(String, String)>,
    expires_at: Option<DateTime<Utc>>,
}

impl CredentialEnv {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            // Refresh a little early so a credential never lapses
            // mid-invocation.
            Some(at) => at - ChronoDuration::minutes(5) > Utc::now(),
            None => true,
        }
    }
}

/// Resolves and caches per-unit credential environments.
#[derive(Default)]
pub struct AuthResolver {
    cache: Mutex<HashMap<String, CredentialEnv>>,
}

impl AuthResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the environment variables to inject for this unit, in
    /// precedence order. The inherited process env needs no entries here;
    /// child processes receive it implicitly.
    pub fn resolve(&self, config: &UnitConfig) -> StratusResult<Vec<(String, String)>> {
        if let Some(cmd) = &config.auth_provider_cmd {
            return self.cached(&format!("cmd:{}:{cmd}", config.unit_dir.display()), || {
                self.run_provider_cmd(cmd, &config.unit_dir)
            });
        }
        if let Some(assume) = &config.iam_assume {
            return self.cached(&format!("role:{}", assume.role_arn), || {
                self.assume_role(assume)
            });
        }
        Ok(Vec::new())
    }

    fn cached<F>(&self, key: &str, produce: F) -> StratusResult<Vec<(String, String)>>
    where
        F: FnOnce() -> StratusResult<CredentialEnv>,
    {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(hit) = cache.get(key) {
                if hit.is_fresh() {
                    return Ok(hit.vars.clone());
                }
                debug!("credentials for {key} expired, refreshing");
            }
        }
        let fresh = produce()?;
        let vars = fresh.vars.clone();
        self.cache.lock().unwrap().insert(key.to_string(), fresh);
        Ok(vars)
    }

    fn run_provider_cmd(&self, cmd: &str, unit_dir: &Path) -> StratusResult<CredentialEnv> {
        let words = shell_words::split(cmd).map_err(|e| StratusError::Auth {
            method: "auth_provider_cmd".to_string(),
            message: format!("cannot parse command: {e}"),
        })?;
        let (program, args) = words.split_first().ok_or_else(|| StratusError::Auth {
            method: "auth_provider_cmd".to_string(),
            message: "empty command".to_string(),
        })?;

        let output = std::process::Command::new(program)
            .args(args)
            .current_dir(unit_dir)
            .output()
            .map_err(|e| StratusError::Auth {
                method: "auth_provider_cmd".to_string(),
                message: format!("failed to spawn {program}: {e}"),
            })?;
        if !output.status.success() {
            return Err(StratusError::Auth {
                method: "auth_provider_cmd".to_string(),
                message: format!(
                    "{program} exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let parsed: ProviderCmdOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| StratusError::Auth {
                method: "auth_provider_cmd".to_string(),
                message: format!("invalid JSON on stdout: {e}"),
            })?;

        let mut vars: Vec<(String, String)> = Vec::new();
        if let Some(envs) = parsed.envs {
            vars.extend(envs);
        }

        let mut expires_at = None;
        if let Some(role) = &parsed.aws_role {
            if parsed.aws_credentials.is_none() {
                let assume = IamAssume {
                    role_arn: role.role_arn.clone(),
                    session_name: role.session_name.clone(),
                    duration_secs: role.duration,
                    web_identity_token: role.web_identity_token.clone(),
                };
                let derived = self.assume_role(&assume)?;
                vars.extend(derived.vars);
                expires_at = derived.expires_at;
            }
        }
        // Static credentials win over a role from the same output.
        if let Some(creds) = parsed.aws_credentials {
            vars.push(("AWS_ACCESS_KEY_ID".to_string(), creds.access_key_id));
            vars.push(("AWS_SECRET_ACCESS_KEY".to_string(), creds.secret_access_key));
            if let Some(token) = creds.session_token {
                vars.push(("AWS_SESSION_TOKEN".to_string(), token));
            }
        }

        Ok(CredentialEnv { vars, expires_at })
    }

    /// Performs role assumption through the AWS CLI, which carries the
    /// standard and web-identity flows without an SDK dependency.
    fn assume_role(&self, assume: &IamAssume) -> StratusResult<CredentialEnv> {
        let session_name = assume
            .session_name
            .clone()
            .unwrap_or_else(|| format!("stratus-{}", uuid::Uuid::new_v4()));
        let duration = assume.duration_secs.unwrap_or(3600).to_string();

        let mut cmd = std::process::Command::new("aws");
        cmd.arg("sts");
        match &assume.web_identity_token {
            Some(token) => {
                cmd.args(["assume-role-with-web-identity", "--role-arn"])
                    .arg(&assume.role_arn)
                    .args(["--role-session-name", &session_name])
                    .args(["--web-identity-token", token]);
            }
            None => {
                cmd.args(["assume-role", "--role-arn"])
                    .arg(&assume.role_arn)
                    .args(["--role-session-name", &session_name]);
            }
        }
        cmd.args(["--duration-seconds", &duration, "--output", "json"]);

        let output = cmd.output().map_err(|e| StratusError::Auth {
            method: "iam_role".to_string(),
            message: format!("failed to spawn aws: {e}"),
        })?;
        if !output.status.success() {
            return Err(StratusError::Auth {
                method: "iam_role".to_string(),
                message: format!(
                    "assuming {} failed: {}",
                    assume.role_arn,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        #[derive(Deserialize)]
        struct StsResponse {
            #[serde(rename = "Credentials")]
            credentials: StsCredentials,
        }
        #[derive(Deserialize)]
        struct StsCredentials {
            #[serde(rename = "AccessKeyId")]
            access_key_id: String,
            #[serde(rename = "SecretAccessKey")]
            secret_access_key: String,
            #[serde(rename = "SessionToken")]
            session_token: String,
            #[serde(rename = "Expiration")]
            expiration: Option<String>,
        }

        let parsed: StsResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| StratusError::Auth {
                method: "iam_role".to_string(),
                message: format!("invalid STS response: {e}"),
            })?;

        let expires_at = parsed
            .credentials
            .expiration
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if expires_at.is_none() {
            warn!("STS response for {} has no expiration", assume.role_arn);
        }

        Ok(CredentialEnv {
            vars: vec![
                ("AWS_ACCESS_KEY_ID".to_string(), parsed.credentials.access_key_id),
                (
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    parsed.credentials.secret_access_key,
                ),
                ("AWS_SESSION_TOKEN".to_string(), parsed.credentials.session_token),
            ],
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unit_with_provider_cmd(dir: &Path, cmd: &str) -> UnitConfig {
        let mut config = UnitConfig::new(&dir.join("terragrunt.hcl"));
        config.auth_provider_cmd = Some(cmd.to_string());
        config
    }

    #[test]
    fn test_no_auth_configured_is_empty() {
        let config = UnitConfig::new(&PathBuf::from("/repo/app/terragrunt.hcl"));
        let resolver = AuthResolver::new();
        assert!(resolver.resolve(&config).unwrap().is_empty());
    }

    #[test]
    fn test_provider_cmd_envs_and_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let config = unit_with_provider_cmd(
            tmp.path(),
            r#"echo '{"awsCredentials":{"ACCESS_KEY_ID":"AKIA123","SECRET_ACCESS_KEY":"secret"},"envs":{"EXTRA":"1"}}'"#,
        );
        let resolver = AuthResolver::new();
        let vars = resolver.resolve(&config).unwrap();

        let lookup = |k: &str| {
            vars.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("AWS_ACCESS_KEY_ID"), Some("AKIA123"));
        assert_eq!(lookup("AWS_SECRET_ACCESS_KEY"), Some("secret"));
        assert_eq!(lookup("EXTRA"), Some("1"));
    }

    #[test]
    fn test_provider_cmd_failure_is_auth_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = unit_with_provider_cmd(tmp.path(), "false");
        let resolver = AuthResolver::new();
        let err = resolver.resolve(&config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }

    #[test]
    fn test_provider_cmd_invalid_json_is_auth_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = unit_with_provider_cmd(tmp.path(), "echo not-json");
        let resolver = AuthResolver::new();
        let err = resolver.resolve(&config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }

    #[test]
    fn test_provider_cmd_result_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("calls");
        // Appends to the marker file on every invocation; output carries no
        // expiry, so the first result stays fresh.
        let cmd = format!(
            "sh -c 'echo x >> {} && echo {{\"envs\":{{\"A\":\"1\"}}}}'",
            marker.display()
        );
        let config = unit_with_provider_cmd(tmp.path(), &cmd);
        let resolver = AuthResolver::new();
        resolver.resolve(&config).unwrap();
        resolver.resolve(&config).unwrap();
        let calls = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }
}
