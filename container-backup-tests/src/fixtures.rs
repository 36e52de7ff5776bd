//! Test fixtures and sample data
//!
//! Container descriptions for common stacks and helpers for the archives
//! a run produces.

use container_backup::utils::docker_ops::{ContainerInfo, Mount};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Compose label used to group containers
pub const COMPOSE_LABEL: &str = "com.docker.compose.project";

/// A running container belonging to compose project `stack`
pub fn container(stack: &str, name: &str, image: &str) -> ContainerInfo {
    ContainerInfo {
        id: format!("id-{}", name),
        name: name.to_string(),
        image: image.to_string(),
        hostname: name.to_string(),
        running: true,
        labels: HashMap::from([(COMPOSE_LABEL.to_string(), stack.to_string())]),
        ..Default::default()
    }
}

/// Same container with an extra label
pub fn labelled(mut container: ContainerInfo, key: &str, value: &str) -> ContainerInfo {
    container.labels.insert(key.to_string(), value.to_string());
    container
}

/// Same container with environment variables
pub fn with_env(mut container: ContainerInfo, env: &[(&str, &str)]) -> ContainerInfo {
    container
        .env
        .extend(env.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    container
}

/// Same container with a bind mount
pub fn with_mount(mut container: ContainerInfo, source: &Path, destination: &str) -> ContainerInfo {
    container.mounts.push(Mount {
        kind: "bind".to_string(),
        source: source.to_path_buf(),
        destination: destination.to_string(),
    });
    container
}

/// WordPress with its MySQL database
pub fn wordpress_stack() -> Vec<ContainerInfo> {
    vec![
        container("wordpress", "wordpress-app", "wordpress:6.4-apache"),
        container("wordpress", "wordpress-db", "mysql:8.0"),
    ]
}

/// Stack environment WordPress deployments typically carry
pub fn wordpress_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("MYSQL_ROOT_PASSWORD", "root-secret"),
        ("MYSQL_DATABASE", "wordpress"),
        ("WORDPRESS_DB_HOST", "wordpress-db"),
    ]
}

/// Stack environment with Postgres credentials
pub fn postgres_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("POSTGRES_USER", "app"),
        ("POSTGRES_PASSWORD", "app-secret"),
        ("POSTGRES_DB", "app"),
    ]
}

/// Lay out a WordPress data directory beneath `data_root`
pub fn wordpress_data(data_root: &Path) -> PathBuf {
    let content = data_root.join("wordpress").join("wp-content");
    write_file(&content.join("uploads/2024/01/photo.jpg"), "jpeg");
    write_file(&content.join("themes/site/style.css"), "body {}");
    write_file(&content.join("cache/page/index.html"), "<html>");
    write_file(&content.join("debug.log"), "PHP Notice");
    content
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, contents).expect("Failed to write file");
}

/// Entry names of a `.tar.gz`, directories without trailing slash
pub fn archive_entries(path: &Path) -> Vec<String> {
    let file = File::open(path).expect("Failed to open archive");
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut names: Vec<String> = archive
        .entries()
        .expect("Failed to read archive")
        .map(|e| {
            let entry = e.expect("Failed to read entry");
            let path = entry.path().expect("Invalid entry path");
            path.to_string_lossy().trim_end_matches('/').to_string()
        })
        .collect();
    names.sort();
    names
}

/// Contents of one entry of a `.tar.gz`
pub fn archive_file(path: &Path, name: &str) -> Option<Vec<u8>> {
    let file = File::open(path).expect("Failed to open archive");
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().expect("Failed to read archive") {
        let mut entry = entry.expect("Failed to read entry");
        if entry.path().ok()?.to_string_lossy() == name {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).ok()?;
            return Some(contents);
        }
    }
    None
}

/// Decompress a gzip blob
pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("Failed to decompress");
    out
}

/// Archives in the backup root, sorted by name
pub fn list_archives(backup_dir: &Path) -> Vec<PathBuf> {
    let mut archives: Vec<PathBuf> = match fs::read_dir(backup_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".tar.gz"))
            .collect(),
        Err(_) => Vec::new(),
    };
    archives.sort();
    archives
}
