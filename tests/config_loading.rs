use std::fs;

use anyhow::Result;
use orchestra_rs::errors::UnknownSchemaError;
use orchestra_rs::{Config, HttpRequest, Level, Logger, QueryOptions};
use serde_json::{json, Value};
use tempfile::tempdir;

const CONFIG: &str = r#"
address: 0.0.0.0:9000
datasets:
  endpoints:
    projects:
      url: http://deploy.local/{{ .vars.env }}/projects
      filters:
        - projects
"#;

const DATASET: &str = r#"
queries:
  deployments:
    summary: Projects deployed to one environment
    pipeline:
      required:
        variables:
          env: "^(dev|prod)$"
      steps:
        - target: projects
          query:
            endpoint: projects
          transforms:
            - "$sort($)"
"#;

#[test]
fn datasets_extend_the_config_file() -> Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("config.yaml");
    let datasets = dir.path().join("datasets");
    fs::create_dir_all(datasets.join("deploy"))?;
    fs::write(&config_path, CONFIG)?;
    fs::write(datasets.join("deploy/queries.yml"), DATASET)?;

    let logger = Logger::capturing(Level::Debug);
    let config = Config::load(&config_path, true, &[datasets], &logger)?;
    assert_eq!(config.address(), "0.0.0.0:9000");
    assert_eq!(config.datasets.queries["deployments"].name, "deployments");

    let ctx = config
        .datasets
        .registry()
        .context()
        .with_logger(logger.clone())
        .with_transport(|request: &HttpRequest| -> Result<Value> {
            assert_eq!(request.url.path(), "/prod/projects");
            Ok(json!({ "projects": ["web", "api", "db"] }))
        });

    let options = QueryOptions::new().with_variable("env", "prod");
    let response = config
        .datasets
        .query_schema(&ctx, "deployments", Some(&options))
        .map_err(|failure| failure.into_error())?;
    assert_eq!(response.result, json!({ "projects": ["api", "db", "web"] }));

    let calls: Vec<Value> = logger
        .captured()
        .into_iter()
        .filter(|entry| entry["message"] == "calling endpoint")
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["tags"]["pipeline"], "deployments");
    assert_eq!(calls[0]["tags"]["step"], "projects");
    Ok(())
}

#[test]
fn invalid_variables_are_rejected_and_unknown_queries_reported() -> Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, CONFIG)?;
    fs::create_dir(dir.path().join("datasets"))?;
    fs::write(dir.path().join("datasets/queries.yaml"), DATASET)?;

    let logger = Logger::capturing(Level::Info);
    let config = Config::load(&config_path, true, &[dir.path().join("datasets")], &logger)?;
    let ctx = config.datasets.registry().context().with_logger(logger);

    let options = QueryOptions::new().with_variable("env", "staging");
    let failure = config
        .datasets
        .query_schema(&ctx, "deployments", Some(&options))
        .unwrap_err();
    assert_eq!(
        failure.response.errors,
        vec!["pipeline deployments variable: value for 'env' must match expression '^(dev|prod)$'"]
    );
    assert_eq!(failure.response.query, Some(options));

    let failure = config.datasets.query_schema(&ctx, "nothing", None).unwrap_err();
    assert!(failure.downcast_ref::<UnknownSchemaError>().is_some());
    Ok(())
}
