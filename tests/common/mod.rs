//! Shared fixtures: archives built with the real codecs, and an orchestrator
//! wired the same way the binary wires it.

#![allow(dead_code)]

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use trawl::checkpoint::CheckpointManager;
use trawl::classify::Classifier;
use trawl::config::PipelineConfig;
use trawl::normalize::Normalizer;
use trawl::pipeline::{Orchestrator, PipelineOptions};
use trawl::retry::RetryPolicy;
use trawl::source::DirectorySource;
use trawl::store::EntityStore;

/// JSON records: `name` names the entity, `name` + `description` are searched.
pub const JSON_CONFIG: &str = r#"
[source]
name = "test"

[records]
name_field = "name"
text_fields = ["name", "description"]

[classifier]
normalization_constant = 1.0

[[classifier.categories]]
name = "explicit_mentions"
weight = 0.6
patterns = ["china shipping development"]

[[classifier.categories]]
name = "state_owned"
weight = 0.5
patterns = ["cosco", "huawei"]
exclusions = ["cosco fan club"]

[pipeline]
workers = 2
batch_size = 3

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 2
"#;

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Stored members keep their bytes verbatim, so a test can corrupt one in place.
pub fn stored_zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Flips one byte in the middle of `member`'s bytes inside `archive`.
pub fn flip_inside(archive: &mut [u8], member: &[u8]) {
    let at = archive
        .windows(member.len())
        .position(|w| w == member)
        .expect("member bytes not found verbatim");
    archive[at + member.len() / 2] ^= 0xff;
}

pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn gz_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn bz2_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn write(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

pub fn jsonl(records: &[serde_json::Value]) -> Vec<u8> {
    let mut out = String::new();
    for r in records {
        out.push_str(&r.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

/// Builds an orchestrator over `input`, keeping its database and checkpoint in `work`.
pub fn orchestrator(config_toml: &str, input: &Path, work: &Path) -> Orchestrator {
    let config = PipelineConfig::from_toml(config_toml).unwrap();
    let store = EntityStore::open(&work.join("entities.db"), &config.store)
        .unwrap()
        .with_retry(RetryPolicy::from(&config.retry));
    Orchestrator::new(
        Box::new(DirectorySource::new(
            &config.source.name,
            input,
            &config.source.extensions,
        )),
        Classifier::new(&config.classifier).unwrap(),
        Normalizer::new(&config.normalizer),
        CheckpointManager::open(work.join("checkpoint.json")).unwrap(),
        store,
        PipelineOptions::from_config(&config),
    )
}
