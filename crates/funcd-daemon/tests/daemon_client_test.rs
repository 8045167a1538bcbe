// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DaemonClient against a fake daemon on a Unix socket.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{FakeDaemon, reply, reply_chunked};
use funcd_daemon::{
    BuildOptions, ContainerFilters, ContainerRuntime, ContainerSpec, DaemonClient, DaemonConfig,
    DaemonFlavor, ProtocolError, RuntimeError, StopOutcome, WaitCondition,
};

#[tokio::test]
async fn test_ping_uses_native_path_on_podman() {
    let daemon = FakeDaemon::start(|_| reply(200, "OK")).await;
    let client = daemon.client(DaemonFlavor::Podman);

    client.ping().await.unwrap();

    let requests = daemon.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/v4.0.0/libpod/_ping");
    assert_eq!(requests[0].header("connection"), Some("close"));
}

#[tokio::test]
async fn test_existence_checks_per_flavor() {
    let daemon = FakeDaemon::start(|req| {
        if req.target.contains("present") {
            reply(if req.target.contains("exists") { 204 } else { 200 }, "")
        } else {
            reply(404, r#"{"message":"no such container"}"#)
        }
    })
    .await;

    let podman = daemon.client(DaemonFlavor::Podman);
    assert!(podman.container_exists("present").await.unwrap());
    assert!(!podman.container_exists("absent").await.unwrap());

    let docker = daemon.client(DaemonFlavor::Docker);
    assert!(docker.container_exists("present").await.unwrap());
    assert!(!docker.image_exists("absent:v1").await.unwrap());

    assert_eq!(
        daemon.targets(),
        vec![
            "/v4.0.0/libpod/containers/present/exists",
            "/v4.0.0/libpod/containers/absent/exists",
            "/v1.41/containers/present/json",
            "/v1.41/images/absent:v1/json",
        ]
    );
}

#[tokio::test]
async fn test_create_forwards_spec_and_returns_id() {
    let daemon =
        FakeDaemon::start(|_| reply(201, r#"{"Id":"c0ffee","Warnings":[]}"#)).await;
    let client = daemon.client(DaemonFlavor::Docker);

    let spec = ContainerSpec::new("funcd-fn-a:v1")
        .with_name("funcd-a-1234")
        .with_env("FUNCD_FUNCTION_ID", "a")
        .with_memory_mb(20)
        .with_cpu_share(0.5)
        .with_network_mode("none");
    let id = client.create_container(&spec).await.unwrap();
    assert_eq!(id, "c0ffee");

    let request = &daemon.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.target, "/v1.41/containers/create?name=funcd-a-1234");
    assert_eq!(request.header("content-type"), Some("application/json"));

    let body = request.body_json();
    assert_eq!(body["Image"], "funcd-fn-a:v1");
    assert_eq!(body["Env"][0], "FUNCD_FUNCTION_ID=a");
    assert_eq!(body["HostConfig"]["Memory"], 20 * 1024 * 1024);
    assert_eq!(body["HostConfig"]["NanoCpus"], 500_000_000);
    assert_eq!(body["HostConfig"]["NetworkMode"], "none");
}

#[tokio::test]
async fn test_stop_statuses_map_to_outcomes() {
    let daemon = FakeDaemon::start(|req| {
        if req.target.contains("/running/") {
            reply(204, "")
        } else if req.target.contains("/stopped/") {
            reply(304, "")
        } else {
            reply(404, r#"{"message":"no such container"}"#)
        }
    })
    .await;
    let client = daemon.client(DaemonFlavor::Podman);

    assert_eq!(
        client
            .stop_container("running", Some(Duration::from_secs(5)))
            .await
            .unwrap(),
        StopOutcome::Stopped
    );
    assert_eq!(
        client.stop_container("stopped", None).await.unwrap(),
        StopOutcome::AlreadyStopped
    );
    assert_eq!(
        client.stop_container("gone", None).await.unwrap(),
        StopOutcome::NotFound
    );
    assert_eq!(daemon.targets()[0], "/v4.0.0/containers/running/stop?t=5");
}

#[tokio::test]
async fn test_delete_missing_container_is_benign() {
    let daemon = FakeDaemon::start(|_| reply(404, r#"{"message":"no such container"}"#)).await;
    let client = daemon.client(DaemonFlavor::Podman);

    assert!(!client.delete_container("gone", true).await.unwrap());
    assert_eq!(
        daemon.requests()[0].target,
        "/v4.0.0/containers/gone?force=true&v=true"
    );
    assert_eq!(daemon.requests()[0].method, "DELETE");
}

#[tokio::test]
async fn test_invalid_signal_never_reaches_daemon() {
    let daemon = FakeDaemon::start(|_| reply(204, "")).await;
    let client = daemon.client(DaemonFlavor::Docker);

    let err = client.kill_container("c1", "SIGBOGUS").await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidSignal(_)));
    assert!(daemon.requests().is_empty());

    client.kill_container("c1", "kill").await.unwrap();
    assert_eq!(daemon.targets(), vec!["/v1.41/containers/c1/kill?signal=SIGKILL"]);
}

#[tokio::test]
async fn test_server_error_carries_body_and_is_transient() {
    let daemon =
        FakeDaemon::start(|_| reply(500, r#"{"message":"storage driver failure"}"#)).await;
    let client = daemon.client(DaemonFlavor::Podman);

    let err = client.start_container("c1").await.unwrap_err();
    assert!(err.is_transient());
    match err {
        RuntimeError::Daemon { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "storage driver failure");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_conflict_is_reported() {
    let daemon = FakeDaemon::start(|_| reply(409, r#"{"message":"name already in use"}"#)).await;
    let client = daemon.client(DaemonFlavor::Podman);

    let err = client
        .create_container(&ContainerSpec::new("img").with_name("dup"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_chunked_list_response_is_decoded() {
    let body = br#"[{"Id":"c1","Names":["/a"],"Image":"img","State":"running","Labels":{"app":"x"},"Created":1700000000},{"Id":"c2","Names":["/b"],"Image":"img","State":"exited","Labels":null,"Created":1700000001}]"#;
    let daemon = FakeDaemon::start(move |_| {
        reply_chunked(200, &[&body[..10], &body[10..100], &body[100..]])
    })
    .await;
    let client = daemon.client(DaemonFlavor::Docker);

    let filters = ContainerFilters::new().label("app=x");
    let containers = client.list_containers(&filters, true).await.unwrap();
    assert_eq!(containers.len(), 2);
    assert_eq!(containers[0].name(), "a");
    assert!(containers[0].state().is_running());
    assert_eq!(containers[1].labels, None);

    assert_eq!(
        daemon.targets()[0],
        "/v1.41/containers/json?all=true&filters=%7B%22label%22%3A%5B%22app%3Dx%22%5D%7D"
    );
}

#[tokio::test]
async fn test_logs_are_demultiplexed() {
    let mut frames = Vec::new();
    frames.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 7]);
    frames.extend_from_slice(b"result\n");
    frames.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 6]);
    frames.extend_from_slice(b"warn!\n");
    let daemon = FakeDaemon::start(move |_| reply_chunked(200, &[&frames[..]])).await;
    let client = daemon.client(DaemonFlavor::Podman);

    let logs = client.container_logs("c1").await.unwrap();
    assert_eq!(logs.stdout_lines(), vec!["result"]);
    assert_eq!(logs.stderr_lines(), vec!["warn!"]);
}

#[tokio::test]
async fn test_kill_with_filter_returns_only_successes() {
    let daemon = FakeDaemon::start(|req| {
        if req.target.contains("containers/json") {
            reply(
                200,
                r#"[{"Id":"c1","State":"running"},{"Id":"c2","State":"running"},{"Id":"c3","State":"running"}]"#,
            )
        } else if req.target.contains("/c2/kill") {
            reply(500, r#"{"message":"cannot kill"}"#)
        } else {
            reply(204, "")
        }
    })
    .await;
    let client = daemon.client(DaemonFlavor::Podman);

    let mut killed = client
        .kill_with_filter(&ContainerFilters::new().label("app=x"), "SIGKILL")
        .await
        .unwrap();
    killed.sort();
    assert_eq!(killed, vec!["c1", "c3"]);
    assert_eq!(daemon.requests().len(), 4);
}

#[tokio::test]
async fn test_wait_polls_until_exit() {
    let polls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = polls.clone();
    let daemon = FakeDaemon::start(move |_| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n < 2 {
            reply(200, r#"{"Id":"c1","State":{"Status":"running","ExitCode":0}}"#)
        } else {
            reply(200, r#"{"Id":"c1","State":{"Status":"exited","ExitCode":2}}"#)
        }
    })
    .await;
    let client = daemon.client(DaemonFlavor::Docker);

    let exit = client
        .wait_container(
            "c1",
            WaitCondition::NotRunning,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(exit.exit_code, 2);
    assert_eq!(daemon.requests().len(), 3);
}

#[tokio::test]
async fn test_pull_stream_error_fails() {
    let daemon = FakeDaemon::start(|_| {
        reply(
            200,
            "{\"status\":\"Pulling from library/nope\"}\r\n{\"error\":\"manifest unknown\"}\r\n",
        )
    })
    .await;
    let client = daemon.client(DaemonFlavor::Docker);

    let err = client.pull_image("nope").await.unwrap_err();
    assert!(matches!(err, RuntimeError::PullFailed(ref m) if m == "manifest unknown"));
    assert_eq!(
        daemon.targets(),
        vec!["/v1.41/images/create?fromImage=nope&tag=latest"]
    );
}

#[tokio::test]
async fn test_build_sends_context_and_collects_logs() {
    let daemon = FakeDaemon::start(|req| {
        if req.target.contains("/exists") {
            reply(404, "")
        } else if req.target.contains("libpod/info") {
            reply(200, r#"{"host":{"os":"linux","arch":"arm64"}}"#)
        } else {
            reply(
                200,
                "{\"stream\":\"Step 1/2 : FROM alpine\\n\"}\n{\"stream\":\"\\n\"}\n{\"aux\":{\"ID\":\"sha256:beef\"}}\n{\"stream\":\"Successfully tagged fn:v1\\n\"}\n",
            )
        }
    })
    .await;
    let client = daemon.client(DaemonFlavor::Podman);

    let output = client
        .build_image("fn:v1", Bytes::from_static(b"tar-bytes"), &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(output.platform, "linux/arm64");
    assert_eq!(output.image_id.as_deref(), Some("sha256:beef"));
    assert_eq!(
        output.logs,
        vec!["Step 1/2 : FROM alpine", "Successfully tagged fn:v1"]
    );

    let build = daemon
        .requests()
        .into_iter()
        .find(|r| r.target.starts_with("/v4.0.0/build?"))
        .unwrap();
    assert!(build.target.contains("t=fn%3Av1"));
    assert!(build.target.contains("platform=linux%2Farm64"));
    assert_eq!(build.header("content-type"), Some("application/x-tar"));
    assert_eq!(build.body, b"tar-bytes");
}

#[tokio::test]
async fn test_build_refuses_existing_tag() {
    let daemon = FakeDaemon::start(|_| reply(204, "")).await;
    let client = daemon.client(DaemonFlavor::Podman);

    let err = client
        .build_image("fn:v1", Bytes::new(), &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ImageExists(_)));
    assert_eq!(daemon.requests().len(), 1);
}

#[tokio::test]
async fn test_build_error_line_fails() {
    let daemon = FakeDaemon::start(|req| {
        if req.target.contains("/exists") {
            reply(404, "")
        } else {
            reply(
                200,
                "{\"stream\":\"Step 1/1\\n\"}\n{\"error\":\"COPY failed\",\"errorDetail\":{\"message\":\"COPY failed\"}}\n",
            )
        }
    })
    .await;
    let client = daemon.client(DaemonFlavor::Podman);

    let options = BuildOptions {
        platform: Some("linux/amd64".into()),
        ..BuildOptions::default()
    };
    let err = client
        .build_image("fn:v1", Bytes::new(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::BuildFailed(ref m) if m == "COPY failed"));
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let daemon = FakeDaemon::start(|_| None).await;
    let client = DaemonClient::new(
        DaemonConfig::new(&daemon.socket_path, DaemonFlavor::Podman)
            .with_request_timeout(Duration::from_millis(100)),
    );

    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Protocol(ProtocolError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_garbage_response_is_protocol_error() {
    let daemon = FakeDaemon::start(|_| Some(b"not http at all\r\n\r\n".to_vec())).await;
    let client = daemon.client(DaemonFlavor::Podman);

    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Protocol(ProtocolError::MalformedStatusLine(_))
    ));
}

#[tokio::test]
async fn test_platform_falls_back_on_failure() {
    let daemon = FakeDaemon::start(|_| reply(500, "")).await;
    let client = daemon.client(DaemonFlavor::Docker);

    assert_eq!(client.platform().await, "linux/amd64");
}
