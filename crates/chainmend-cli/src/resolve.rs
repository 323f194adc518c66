use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const TRANSCRIPT_EXTENSION: &str = "jsonl";

pub fn default_projects_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude/projects"))
}

/// An existing path is taken as is; anything else is a session-id prefix
/// matched against transcripts under `projects_dir` and its project folders.
pub fn resolve_target(target: &str, projects_dir: Option<&Path>) -> Result<PathBuf> {
    let target = target.trim();
    if target.is_empty() {
        bail!("Target cannot be empty");
    }

    let as_path = PathBuf::from(target);
    if as_path.is_file() {
        return Ok(as_path);
    }

    let Some(projects_dir) = projects_dir else {
        bail!("{target} is not a file and no projects directory is configured");
    };
    if !projects_dir.is_dir() {
        bail!(
            "{target} is not a file and {} is not a directory",
            projects_dir.display()
        );
    }

    let mut matches = Vec::new();
    collect_matches(projects_dir, target, &mut matches)?;
    for entry in fs::read_dir(projects_dir)
        .with_context(|| format!("Failed to list {}", projects_dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_matches(&path, target, &mut matches)?;
        }
    }
    matches.sort();

    if let Some(exact) = matches
        .iter()
        .find(|path| path.file_stem().and_then(|stem| stem.to_str()) == Some(target))
    {
        return Ok(exact.clone());
    }

    match matches.len() {
        0 => bail!(
            "No transcript matching {target} under {}",
            projects_dir.display()
        ),
        1 => Ok(matches.remove(0)),
        count => {
            let listing = matches
                .iter()
                .map(|path| format!("  {}", path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            bail!("{count} transcripts match {target}; use a longer prefix:\n{listing}")
        }
    }
}

fn collect_matches(dir: &Path, prefix: &str, matches: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION)
        {
            continue;
        }
        let matches_prefix = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.starts_with(prefix));
        if matches_prefix {
            matches.push(path);
        }
    }
    Ok(())
}
