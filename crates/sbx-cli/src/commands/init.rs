use std::path::{Path, PathBuf};

use sbx_infra::{ProviderName, ProviderSettings};
use sbx_ssh::{KeySource, SshAgent};
use tracing::debug;

use crate::cli::InitArgs;
use crate::config::Config;
use crate::error::{CliError, exit};

/// Default identities, most preferred first, relative to `$HOME`.
const DEFAULT_KEYS: &[&str] = &[".ssh/id_ed25519", ".ssh/id_rsa"];

pub async fn run(dir: &Path, args: InitArgs) -> Result<i32, CliError> {
    if Config::exists(dir) && !args.force {
        return Err(CliError::Config(format!(
            "{} already exists; pass --force to overwrite it",
            Config::path(dir).display()
        )));
    }

    let ssh_key = resolve_key(&args).await?;
    let public_key = ssh_key.public_key()?;

    let token = args.token.clone().or_else(|| token_from_env(args.provider));
    if token.is_none() {
        return Err(CliError::Config(format!(
            "no API token for {}: pass --token or set {}",
            args.provider,
            token_env(args.provider)
        )));
    }

    let mut config = Config::new(args.provider, ssh_key);
    config.providers.insert(
        args.provider,
        ProviderSettings {
            token,
            region: args.region,
            instance_type: args.instance_type,
            image: args.image,
        },
    );
    let path = config.save(dir)?;

    println!("wrote {}", path.display());
    println!("  provider: {}", config.default_provider);
    println!("  ssh key:  {} ({})", config.ssh_key.describe(), short_key(&public_key));
    Ok(exit::SUCCESS)
}

fn token_env(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::Hetzner => "HETZNER_API_TOKEN",
    }
}

fn token_from_env(provider: ProviderName) -> Option<String> {
    std::env::var(token_env(provider))
        .ok()
        .filter(|t| !t.trim().is_empty())
}

async fn resolve_key(args: &InitArgs) -> Result<KeySource, CliError> {
    if let Some(path) = &args.ssh_key {
        return Ok(KeySource::File { path: path.clone() });
    }

    if let Some(fingerprint) = &args.agent_key {
        let mut agent = SshAgent::discover().await?;
        let key = agent.get_by_fingerprint(fingerprint).await?;
        debug!(fingerprint = %key.fingerprint, comment = %key.comment, "using agent key");
        return Ok(KeySource::Agent {
            public_key: key.public_key,
            fingerprint: key.fingerprint,
        });
    }

    if let Some(home) = home::home_dir()
        && let Some(path) = detect_default_key(&home)
    {
        debug!(path = %path.display(), "using default key");
        return Ok(KeySource::File { path });
    }

    Err(CliError::Config(format!(
        "no SSH key found in ~/.ssh; pass --ssh-key <path> or --agent-key <fingerprint>{}",
        agent_key_listing().await
    )))
}

/// First default identity whose private and public halves both exist,
/// written with a `~/` prefix so the config survives a moved home.
fn detect_default_key(home: &Path) -> Option<PathBuf> {
    DEFAULT_KEYS.iter().find_map(|rel| {
        let private = home.join(rel);
        let public = home.join(format!("{rel}.pub"));
        (private.is_file() && public.is_file()).then(|| Path::new("~").join(rel))
    })
}

async fn agent_key_listing() -> String {
    let Some(mut agent) = SshAgent::try_discover().await else {
        return String::new();
    };
    match agent.list_keys().await {
        Ok(keys) if !keys.is_empty() => {
            let lines: Vec<String> = keys
                .iter()
                .map(|k| format!("  {} {} {}", k.fingerprint, k.algorithm, k.comment))
                .collect();
            format!("\nkeys in the ssh agent:\n{}", lines.join("\n"))
        }
        Ok(_) => String::new(),
        Err(e) => {
            debug!(error = %e, "could not list agent keys");
            String::new()
        }
    }
}

fn short_key(public_key: &str) -> String {
    let mut parts = public_key.split_whitespace();
    let algorithm = parts.next().unwrap_or_default();
    let blob = parts.next().unwrap_or_default();
    let tail = &blob[blob.len().saturating_sub(12)..];
    format!("{algorithm} ...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(home: &Path, rel: &str) {
        let path = home.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"key").unwrap();
    }

    #[test]
    fn prefers_ed25519() {
        let home = tempfile::tempdir().unwrap();
        touch(home.path(), ".ssh/id_rsa");
        touch(home.path(), ".ssh/id_rsa.pub");
        touch(home.path(), ".ssh/id_ed25519");
        touch(home.path(), ".ssh/id_ed25519.pub");

        assert_eq!(
            detect_default_key(home.path()),
            Some(PathBuf::from("~/.ssh/id_ed25519"))
        );
    }

    #[test]
    fn skips_key_without_public_half() {
        let home = tempfile::tempdir().unwrap();
        touch(home.path(), ".ssh/id_ed25519");
        touch(home.path(), ".ssh/id_rsa");
        touch(home.path(), ".ssh/id_rsa.pub");

        assert_eq!(
            detect_default_key(home.path()),
            Some(PathBuf::from("~/.ssh/id_rsa"))
        );
    }

    #[test]
    fn no_keys_detected() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(detect_default_key(home.path()), None);
    }

    #[test]
    fn short_key_keeps_tail() {
        let short = short_key(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk",
        );
        assert_eq!(short, "ssh-ed25519 ...FnhAAh51FzDk");
    }

    #[tokio::test]
    async fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(Config::path(dir.path()), "default_provider: hetzner\n").unwrap();
        let args = InitArgs {
            provider: ProviderName::Hetzner,
            token: Some("t".into()),
            region: None,
            instance_type: None,
            image: None,
            ssh_key: Some("/nonexistent".into()),
            agent_key: None,
            force: false,
        };

        let err = run(dir.path(), args).await.unwrap_err();
        assert_eq!(err.exit_code(), exit::CONFIG);
    }

    #[tokio::test]
    async fn writes_config_with_file_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"private").unwrap();
        std::fs::write(
            dir.path().join("id_ed25519.pub"),
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk dev@laptop\n",
        )
        .unwrap();
        let args = InitArgs {
            provider: ProviderName::Hetzner,
            token: Some("secret".into()),
            region: Some("hel1".into()),
            instance_type: None,
            image: None,
            ssh_key: Some(key.clone()),
            agent_key: None,
            force: false,
        };

        assert_eq!(run(dir.path(), args).await.unwrap(), exit::SUCCESS);

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.ssh_key, KeySource::File { path: key });
        let hetzner = &config.providers[&ProviderName::Hetzner];
        assert_eq!(hetzner.token.as_deref(), Some("secret"));
        assert_eq!(hetzner.region.as_deref(), Some("hel1"));
    }
}
