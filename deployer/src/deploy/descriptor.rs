//! Build descriptor inspection

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::errors::DeployError;

/// Port assumed when the descriptor has no usable `EXPOSE` directive.
pub const DEFAULT_INTERNAL_PORT: u16 = 8080;

/// The descriptor file of one repository.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub path: PathBuf,
    pub internal_port: u16,
}

impl Descriptor {
    /// Locate `file_name` inside `repo_path` and read its exposed port.
    pub async fn load(repo_path: &Path, file_name: &str) -> Result<Self, DeployError> {
        let path = repo_path.join(file_name);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::MissingDescriptor(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let internal_port = exposed_port(&contents).unwrap_or_else(|| {
            debug!(
                "No EXPOSE directive in {}, using port {}",
                path.display(),
                DEFAULT_INTERNAL_PORT
            );
            DEFAULT_INTERNAL_PORT
        });

        Ok(Self { path, internal_port })
    }
}

/// First port of the first `EXPOSE` line, with any `/tcp`-style suffix
/// stripped. Instruction keywords are case-insensitive.
pub fn exposed_port(contents: &str) -> Option<u16> {
    contents.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        let keyword = words.next()?;
        if !keyword.eq_ignore_ascii_case("EXPOSE") {
            return None;
        }
        let first = words.next()?;
        let port = first.split('/').next()?;
        port.parse::<u16>().ok().filter(|p| *p != 0)
    })
}
