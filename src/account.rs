//! Per-project account records: one file per attached project, read at
//! startup to seed and validate the project set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, R};
use crate::util;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountFile {
    pub master_url: String,
    pub authenticator: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_resource_share")]
    pub resource_share: f64,
}

fn default_resource_share() -> f64 {
    100.0
}

impl AccountFile {
    pub fn read(path: &Path) -> R<AccountFile> {
        let bytes = std::fs::read(path)?;
        let acct: AccountFile = serde_json::from_slice(&bytes)?;
        if !util::valid_master_url(&acct.master_url) {
            return Err(Error::InvalidUrl {
                url: acct.master_url,
            });
        }
        Ok(acct)
    }
}

/// All account files under `dir`, skipping (with a warning) any that
/// fail to parse. A missing directory means no attachments yet.
pub fn read_accounts(dir: &Path) -> R<Vec<AccountFile>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("account_") && n.ends_with(".json"))
        })
        .collect();
    entries.sort();
    for path in entries {
        match AccountFile::read(&path) {
            Ok(acct) => out.push(acct),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable account file");
            }
        }
    }
    Ok(out)
}
