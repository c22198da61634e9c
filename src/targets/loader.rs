use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{LoadedTargets, SkipReason, TargetDescriptor};
use crate::lookup::HostResolver;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open target file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Split a record into `(address, label)`.
///
/// The address ends at the first whitespace run; the label is the rest of
/// the line, or the address text itself when there is no rest.
fn split_record(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((address, rest)) => Some((address, rest.trim_start())),
        None => Some((line, line)),
    }
}

/// Read `<address-or-host> [label]` records, one per line, in order.
///
/// Blank lines and hosts that do not resolve are skipped and reported in
/// [`LoadedTargets::skipped`]. A read error stops loading but keeps the
/// records read so far.
pub async fn load_targets<R: BufRead>(reader: R, resolver: &dyn HostResolver) -> LoadedTargets {
    let mut loaded = LoadedTargets::default();

    for (idx, line) in reader.lines().enumerate() {
        let position = idx + 1;
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(position, error = %e, "error reading target file, stopping");
                loaded.read_error = Some(e.to_string());
                break;
            }
        };

        let Some((address, label)) = split_record(&line) else {
            loaded.skip(position, &line, SkipReason::Blank);
            continue;
        };

        let resolved = match address.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match resolver.resolve(address, None).await {
                Ok(addrs) => match addrs.first() {
                    Some(ip) => *ip,
                    None => {
                        loaded.skip(
                            position,
                            &line,
                            SkipReason::Unresolvable("no addresses".to_string()),
                        );
                        continue;
                    }
                },
                Err(e) => {
                    loaded.skip(position, &line, SkipReason::Unresolvable(e.to_string()));
                    continue;
                }
            },
        };

        loaded.targets.push(TargetDescriptor::new(resolved, label));
    }

    loaded
}

/// Open and load a target file. Failing to open it is fatal to the batch.
pub async fn load_target_file(
    path: &Path,
    resolver: &dyn HostResolver,
) -> Result<LoadedTargets, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(load_targets(BufReader::new(file), resolver).await)
}
