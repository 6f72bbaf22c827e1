//! chaindex-dump — inspect a checkpoint directory.
//!
//! Usage:
//!   chaindex-dump <checkpoint-dir> [token]
//!
//! With no token, lists every token found under the directory. With a
//! token, pretty-prints its manifest and per-group image sizes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chaindex::checkpoint::read_manifest;

fn list_tokens(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut tokens = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.path().join("manifest.json").is_file() {
            tokens.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    tokens.sort();
    Ok(tokens)
}

fn image_size(path: PathBuf) -> String {
    match std::fs::metadata(&path) {
        Ok(m) => format!("{} bytes", m.len()),
        Err(_) => "absent".to_string(),
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let Some(dir) = args.next() else {
        return Err("usage: chaindex-dump <checkpoint-dir> [token]".into());
    };
    let dir = PathBuf::from(dir);

    let Some(token) = args.next() else {
        let tokens = list_tokens(&dir).map_err(|e| format!("{}: {e}", dir.display()))?;
        if tokens.is_empty() {
            println!("no checkpoints under {}", dir.display());
        }
        for t in tokens {
            println!("{t}");
        }
        return Ok(());
    };

    let manifest = read_manifest(&dir, &token).map_err(|e| e.to_string())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&manifest).map_err(|e| e.to_string())?
    );
    for g in &manifest.groups {
        let tdir = dir.join(&token);
        println!(
            "group {:03}: table {} / log {}",
            g.group,
            image_size(tdir.join(format!("group-{:03}.table.bin", g.group))),
            image_size(tdir.join(format!("group-{:03}.log.bin", g.group))),
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("chaindex-dump: {msg}");
            ExitCode::FAILURE
        }
    }
}
