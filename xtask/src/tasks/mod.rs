pub mod evaluate;
pub mod ingest;
pub mod train;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};

#[cfg(not(any(feature = "wgpu", feature = "ndarray")))]
compile_error!("enable the `wgpu` or the `ndarray` feature to pick a backend");

#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type MyBackend = burn::backend::Wgpu<f32, i32>;
#[cfg(feature = "ndarray")]
pub type MyBackend = burn::backend::NdArray<f32>;

pub type MyAutodiffBackend = burn::backend::Autodiff<MyBackend>;

pub const SPLIT_FILE: &str = "split.json";
pub const UNET_CONFIG_FILE: &str = "unet.json";
pub const CNN3D_CONFIG_FILE: &str = "cnn3d.json";

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))

}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(serde_json::from_reader(file)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_medseg::dataset::PatientSplit;

    #[test]
    fn json_round_trip_is_complete_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SPLIT_FILE);
        let split = PatientSplit {
            train: (0..500).map(|i| format!("patient-{i:04}")).collect(),
            test: vec!["patient-9999".to_string()],
        };

        write_json(&path, &split).unwrap();

        let loaded: PatientSplit = read_json(&path).unwrap();
        assert_eq!(loaded, split);
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let err = read_json::<PatientSplit>(&path).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }
}
