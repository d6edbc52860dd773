// Rejects lint-suppression attributes in the saving-goals sources.
// Set CHECK_NO_ALLOW=0 to skip the scan.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED: [&str; 2] = ["src", "tests"];
const SKIPPED_DIRS: [&str; 2] = ["target", ".git"];

struct Violation {
    file: PathBuf,
    line: usize,
    text: String,
}

fn main() {
    for dir in SCANNED {
        println!("cargo:rerun-if-changed={dir}");
    }
    println!("cargo:rerun-if-env-changed=CHECK_NO_ALLOW");

    if env::var("CHECK_NO_ALLOW").is_ok_and(|v| v == "0") {
        return;
    }

    let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
        return;
    };

    let mut violations = Vec::new();
    for dir in SCANNED {
        let root = manifest_dir.join(dir);
        if root.exists() {
            collect(&root, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("lint suppression attributes found in saving-goals:");
    for v in &violations {
        eprintln!("  {}:{}: {}", v.file.display(), v.line, v.text.trim());
    }
    panic!("{} lint suppression attribute(s) must be removed", violations.len());
}

fn collect(path: &Path, violations: &mut Vec<Violation>) {
    if path.is_dir() {
        if SKIPPED_DIRS.iter().any(|d| path.ends_with(d)) {
            return;
        }
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            collect(&entry.path(), violations);
        }
        return;
    }

    if path.extension().is_none_or(|ext| ext != "rs") {
        return;
    }

    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let needle = ["#[", "allow"].concat();
    let inner_needle = ["#![", "allow"].concat();
    for (idx, line) in content.lines().enumerate() {
        if line.contains(&needle) || line.contains(&inner_needle) {
            violations.push(Violation {
                file: path.to_path_buf(),
                line: idx + 1,
                text: line.to_string(),
            });
        }
    }
}
