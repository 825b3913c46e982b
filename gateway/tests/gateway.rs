use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use mltf_gateway::{
    config::{
        ExecutorConfig, GatewayConfig, LocalConfig, RemoteConfig, ScriptsConfig, StoreConfig,
        TokenConfig,
    },
    executors::ExecutorError,
    submission::SubmissionError,
    GatewayServer, RegistryError, RunRequest, RunStatus,
};
use mockito::{Matcher, Server, ServerGuard};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

/// unsigned JWT for `subject` valid for another hour
fn token(subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({"sub": subject, "exp": Utc::now().timestamp() + 3600}).to_string(),
    );

    format!("{header}.{payload}.")
}

/// project bundle containing a single `hello.txt`
fn bundle(directory: &Path) -> PathBuf {
    let project = directory.join("project");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("hello.txt"), "hello from the bundle").unwrap();

    let tarball = directory.join("project.tar.gz");
    let status = Command::new("tar")
        .arg("-czf")
        .arg(&tarball)
        .arg("-C")
        .arg(&project)
        .arg(".")
        .status()
        .unwrap();
    assert!(status.success());

    tarball
}

fn request(tarball: PathBuf, backend_config: serde_json::Value) -> RunRequest {
    RunRequest {
        run_id: "run-1".to_owned(),
        tarball_path: tarball,
        entry_point: "main".to_owned(),
        params: [("alpha".to_owned(), "0.5".to_owned())].into_iter().collect(),
        backend_config: serde_json::from_value(backend_config).unwrap(),
        tracking_uri: "http://tracking:5000".to_owned(),
        experiment_id: "3".to_owned(),
        user_subject: "alice".to_owned(),
    }
}

fn remote_config(server: &ServerGuard, scratch: &Path, store: StoreConfig) -> GatewayConfig {
    GatewayConfig {
        executor: ExecutorConfig::Remote(RemoteConfig {
            base_url: Some(server.url()),
            timeout: 5,
            poll_interval: 1,
            auth: TokenConfig {
                token: Some(token("alice")),
                ..Default::default()
            },
            slurm_token: Some(TokenConfig {
                token: Some(token("slurm")),
                ..Default::default()
            }),
            experiment_dir: Some("/tmp/mltf-experiments".to_owned()),
            scratch_dir: scratch.to_path_buf(),
        }),
        scripts: ScriptsConfig::default(),
        store,
    }
}

#[test]
fn local_run_completes_end_to_end() {
    let directory = tempfile::tempdir().unwrap();
    let work_dir = directory.path().join("runs");

    // real launcher, payload that holds until released and reports instead of calling mlflow
    let release = directory.path().join("release");
    let inside = directory.path().join("inside.sh");
    fs::write(
        &inside,
        format!(
            "for _ in $(seq 1 600); do [ -f '{release}' ] && break; sleep 0.1; done\n\
             cat hello.txt\necho\necho \"$MLFLOW_RUN_ID $MLFLOW_EXPERIMENT_ID $MLTF_PARAMS\"\n",
            release = release.display()
        ),
    )
    .unwrap();

    let config = GatewayConfig {
        executor: ExecutorConfig::Local(LocalConfig {
            work_dir: work_dir.clone(),
        }),
        scripts: ScriptsConfig {
            inside,
            ..Default::default()
        },
        store: StoreConfig::File {
            path: directory.path().join("runs.json"),
        },
    };

    let registry = GatewayServer::load(&config).unwrap();
    let reference = registry
        .enqueue_client(request(
            bundle(directory.path()),
            serde_json::json!({"nodes": 2, "mem": "8gb"}),
        ))
        .unwrap();

    assert_eq!(registry.status(&reference).unwrap(), RunStatus::Running);
    assert_eq!(registry.list("alice", false).len(), 1);

    fs::write(&release, "").unwrap();
    assert_eq!(registry.wait(&reference).unwrap(), RunStatus::Completed);
    assert_eq!(registry.status(&reference).unwrap(), RunStatus::Completed);
    assert_eq!(
        fs::read_to_string(work_dir.join("run-1/stdout.log")).unwrap(),
        "hello from the bundle\nrun-1 3 alpha=0.5\n"
    );

    let summaries = registry.list("alice", true);
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].reference, reference);
    assert_eq!(summaries[0].run_id, "run-1");
    assert!(registry.list("alice", false).is_empty());

    // a fresh registry resolves the same reference from disk
    drop(registry);
    let reopened = GatewayServer::load(&config).unwrap();
    assert_eq!(reopened.resolve(&reference).unwrap().request.run_id, "run-1");
}

#[test]
fn remote_submission_end_to_end() {
    let mut server = Server::new();
    let directory = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    let slurm_token = server
        .mock("POST", "/api/cluster_slurm_token")
        .match_body(Matcher::PartialJson(
            serde_json::json!({"slurm_token": token("slurm")}),
        ))
        .with_status(200)
        .create();
    let folder = server
        .mock("POST", "/api/experiment_folder")
        .match_body(Matcher::Json(
            serde_json::json!({"base_experiment_path": "/tmp/mltf-experiments"}),
        ))
        .with_status(200)
        .create();
    let submit = server
        .mock("POST", "/api/slurm")
        .match_header("authorization", Matcher::Regex("^Bearer ".to_owned()))
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"filename="outside.sh""#.to_owned()),
            Matcher::Regex(r#"filename="inside.sh""#.to_owned()),
            Matcher::Regex(r#"filename="project.tar.gz""#.to_owned()),
            Matcher::Regex(
                "/bin/bash input/outside.sh -i input/inside.sh -t input/project.tar.gz".to_owned(),
            ),
            Matcher::Regex("export MLFLOW_RUN_ID=run-1".to_owned()),
            Matcher::Regex(r#""job_name":"mlflow-job""#.to_owned()),
            Matcher::Regex(r#""partition":"shared""#.to_owned()),
            Matcher::Regex(r#""nodes":1"#.to_owned()),
            Matcher::Regex(r#""ntasks-per-node":1"#.to_owned()),
            Matcher::Regex(r#""cpus-per-task":1"#.to_owned()),
            Matcher::Regex(r#""mem":"4gb""#.to_owned()),
            Matcher::Regex(r#""time":"00:05:00""#.to_owned()),
            Matcher::Regex(r#""gpus":null"#.to_owned()),
        ]))
        .with_status(200)
        .with_body(r#"{"success": true, "data": {"job_uuid": "abc-123"}}"#)
        .expect(1)
        .create();
    server
        .mock("GET", "/api/slurm/abc-123")
        .with_status(200)
        .with_body(r#"{"success": true, "data": {"state": "RUNNING"}}"#)
        .create();

    let config = remote_config(
        &server,
        scratch.path(),
        StoreConfig::File {
            path: directory.path().join("runs.json"),
        },
    );
    let registry = GatewayServer::load(&config).unwrap();
    let record = registry
        .enqueue(request(bundle(directory.path()), serde_json::json!({})))
        .unwrap();

    submit.assert();
    slurm_token.assert();
    folder.assert();
    assert_eq!(record.handle.job_ids(), vec!["abc-123".to_owned()]);
    assert_eq!(registry.status(&record.reference).unwrap(), RunStatus::Running);
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);

    // handles read back from disk talk to the same API again
    drop(registry);
    let reopened = GatewayServer::load(&config).unwrap();
    assert_eq!(reopened.status(&record.reference).unwrap(), RunStatus::Running);
    assert_eq!(reopened.list("alice", false).len(), 1);
}

#[test]
fn remote_failure_leaves_no_record() {
    let mut server = Server::new();
    let directory = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    server
        .mock("POST", "/api/cluster_slurm_token")
        .with_status(200)
        .create();
    server
        .mock("POST", "/api/experiment_folder")
        .with_status(200)
        .create();
    server
        .mock("POST", "/api/slurm")
        .with_status(500)
        .with_body("internal error")
        .create();

    let registry =
        GatewayServer::load(&remote_config(&server, scratch.path(), StoreConfig::Memory)).unwrap();
    let result = registry.enqueue(request(bundle(directory.path()), serde_json::json!({})));

    assert!(matches!(
        result,
        Err(RegistryError::Executor(ExecutorError::Submission(SubmissionError::Transport { status, body })))
            if status.as_u16() == 500 && body == "internal error"
    ));
    assert!(registry.is_empty());
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn rejected_submission_keeps_server_message() {
    let mut server = Server::new();
    let directory = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    server
        .mock("POST", Matcher::Regex("^/api/(cluster_slurm_token|experiment_folder)$".to_owned()))
        .with_status(200)
        .create();
    server
        .mock("POST", "/api/slurm")
        .with_status(200)
        .with_body(r#"{"success": false, "message": "partition gpu is closed"}"#)
        .create();

    let registry =
        GatewayServer::load(&remote_config(&server, scratch.path(), StoreConfig::Memory)).unwrap();
    let mut backend_config = BTreeMap::new();
    backend_config.insert("partition", "gpu");

    let result = registry.enqueue(request(
        bundle(directory.path()),
        serde_json::to_value(backend_config).unwrap(),
    ));

    assert!(matches!(
        result,
        Err(RegistryError::Executor(ExecutorError::Submission(SubmissionError::Rejected(message))))
            if message == "partition gpu is closed"
    ));
    assert!(registry.is_empty());
}
