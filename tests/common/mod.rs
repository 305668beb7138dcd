use scopekeeper::config::Config;
use scopekeeper::scope::{ScopeFactory, ServiceCollection};
use scopekeeper::server::{build_app, drafter, App};
use scopekeeper::session::SessionRegistry;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn registry() -> Arc<SessionRegistry> {
    registry_with(ServiceCollection::new())
}

#[allow(dead_code)]
pub fn registry_with(services: ServiceCollection) -> Arc<SessionRegistry> {
    let scopes = Arc::new(ScopeFactory::new(services.build()));
    Arc::new(SessionRegistry::new(scopes, chrono::Duration::minutes(30)))
}

#[allow(dead_code)]
pub fn test_app(config: &Config) -> App {
    build_app(config, drafter::default_services()).expect("failed to build app")
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

#[allow(dead_code)]
pub async fn eventually(attempts: usize, condition: impl Fn() -> bool) -> bool {
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
