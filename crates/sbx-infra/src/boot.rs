//! First-boot shell script passed to new VMs as user data.

use sbx_ssh::quote;

pub const DEFAULT_USER: &str = "sandbox";

/// Written once the boot script has finished.
pub const BOOT_MARKER: &str = "/var/lib/sbx/boot-finished";

pub const BOOT_LOG: &str = "/var/log/sbx-boot.log";

pub const PACKAGES: &[&str] = &[
    "git",
    "curl",
    "jq",
    "tmux",
    "build-essential",
    "ca-certificates",
];

/// Provisions the operating user (passwordless sudo, root's authorized keys),
/// installs base packages and optionally clones a repository into the
/// user's home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootScript {
    pub user: String,
    /// Extra key appended to the user's `authorized_keys`.
    pub authorized_key: Option<String>,
    pub repo: Option<String>,
}

impl Default for BootScript {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            authorized_key: None,
            repo: None,
        }
    }
}

impl BootScript {
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn render(&self) -> String {
        let user = quote(&self.user);
        let home = format!("/home/{}", self.user);
        let qhome = quote(&home);

        let mut script = format!(
            r#"#!/bin/bash
set -euo pipefail
exec >>{log} 2>&1
echo "sbx boot started at $(date -u +%FT%TZ)"

export DEBIAN_FRONTEND=noninteractive
apt-get update -q
apt-get install -y -q {packages}

if ! id -u {user} >/dev/null 2>&1; then
  useradd --create-home --shell /bin/bash {user}
fi
echo {sudoers_line} > /etc/sudoers.d/90-sbx
chmod 0440 /etc/sudoers.d/90-sbx

install -d -m 0700 -o {user} -g {user} {qhome}/.ssh
if [ -f /root/.ssh/authorized_keys ]; then
  cp /root/.ssh/authorized_keys {qhome}/.ssh/authorized_keys
fi
"#,
            log = BOOT_LOG,
            packages = PACKAGES.join(" "),
            sudoers_line = quote(&format!("{} ALL=(ALL) NOPASSWD:ALL", self.user)),
        );

        if let Some(key) = &self.authorized_key {
            script.push_str(&format!(
                "echo {} >> {qhome}/.ssh/authorized_keys\n",
                quote(key)
            ));
        }
        script.push_str(&format!(
            "touch {qhome}/.ssh/authorized_keys\n\
             chown {user}:{user} {qhome}/.ssh/authorized_keys\n\
             chmod 0600 {qhome}/.ssh/authorized_keys\n"
        ));

        if let Some(repo) = &self.repo {
            let target = format!("{home}/{}", repo_dir_name(repo));
            script.push_str(&format!(
                "sudo -u {user} git clone {} {}\n",
                quote(repo),
                quote(&target)
            ));
        }

        script.push_str(&format!(
            "mkdir -p /var/lib/sbx\ntouch {BOOT_MARKER}\necho \"sbx boot finished\"\n"
        ));
        script
    }
}

/// Directory a repository is cloned into: the last path segment of the URL
/// without a trailing `.git`.
pub fn repo_dir_name(repo: &str) -> String {
    let trimmed = repo.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}
