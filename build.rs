// build.rs

use glob::glob;
use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A pose-graph dataset found under `data/`.
#[derive(Debug)]
struct Dataset {
    pub name: String,
    pub path: PathBuf,
}

/// Discovers all g2o datasets by scanning the `data/` directory.
fn get_all_datasets() -> Vec<Dataset> {
    let Ok(entries) = glob("data/*.g2o") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|path| {
            let name = path
                .file_stem()?
                .to_string_lossy()
                .to_lowercase()
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
            let path = env::current_dir().ok()?.join(path);
            Some(Dataset { name, path })
        })
        .collect()
}

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=data");

    // Get the Cargo output directory where we will place the generated code.
    let out_dir = env::var("OUT_DIR").map_err(std::io::Error::other)?;
    let dest_path = Path::new(&out_dir).join("dataset_tests.rs");
    let mut file = BufWriter::new(File::create(&dest_path)?);

    // Generate a separate `#[test]` function for each dataset.
    for dataset in get_all_datasets() {
        let Some(path) = dataset.path.to_str() else {
            continue;
        };
        writeln!(
            file,
            r#"
#[test]
fn dataset_{name}() -> anyhow::Result<()> {{
    run_dataset_test("{path}")
}}
"#,
            name = dataset.name,
            path = path.escape_default()
        )?;
    }
    file.flush()
}
