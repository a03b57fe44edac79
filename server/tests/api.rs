//! HTTP surface exercised in-process, without kernel processes.

mod common;

use axum::http::StatusCode;
use common::{call, call_json, send, server, TOKEN};
use serde_json::json;

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let srv = server("auth");

    let r = send(&srv.app, "GET", "/kernels", None, None).await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
    assert_eq!(r.json()["kind"], "AuthenticationFailed");

    let r = send(&srv.app, "GET", "/kernels", Some("wrong"), None).await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);

    let r = send(&srv.app, "GET", "/kernels", Some(TOKEN), None).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json(), json!([]));

    let r = send(
        &srv.app,
        "GET",
        "/version",
        None,
        None,
    )
    .await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rejected_request_does_not_change_state() {
    let srv = server("auth-state");
    let r = send(
        &srv.app,
        "POST",
        "/environ/SRS_UNAUTHED",
        Some("wrong"),
        Some(("application/x-www-form-urlencoded", "value=1".into())),
    )
    .await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
    assert_eq!(srv.state.environ.get("SRS_UNAUTHED"), None);

    let r = send(&srv.app, "POST", "/kernels", None, None).await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
    assert!(srv.state.registry.list().await.is_empty());
}

#[tokio::test]
async fn test_bearer_scheme_is_accepted() {
    let srv = server("bearer");
    let request = axum::http::Request::builder()
        .uri("/version")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(srv.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_version() {
    let srv = server("version");
    let r = call(&srv.app, "GET", "/version").await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json(), json!(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn test_environ_lifecycle() {
    let srv = server("environ");
    let form = |v: &str| Some(("application/x-www-form-urlencoded", format!("value={v}")));

    let r = send(&srv.app, "POST", "/environ/SRS_FOO", Some(TOKEN), form("bar")).await;
    assert_eq!(r.status, StatusCode::CREATED);

    let r = call(&srv.app, "GET", "/environ/SRS_FOO").await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.text(), "bar");
    assert!(r.headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let r = send(&srv.app, "POST", "/environ/SRS_FOO", Some(TOKEN), form("baz")).await;
    assert_eq!(r.status, StatusCode::OK);

    let r = call(&srv.app, "GET", "/environ").await;
    assert_eq!(r.json()["SRS_FOO"], "baz");

    let r = call(&srv.app, "DELETE", "/environ/SRS_FOO").await;
    assert_eq!(r.status, StatusCode::NO_CONTENT);

    let r = call(&srv.app, "GET", "/environ/SRS_FOO").await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    assert_eq!(r.json()["kind"], "NotFound");

    let r = call(&srv.app, "DELETE", "/environ/SRS_FOO").await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);

    // The overlay never leaks into the server's own environment.
    assert!(std::env::var("SRS_FOO").is_err());
}

#[tokio::test]
async fn test_unknown_kernel_spec_and_missing_ids() {
    let srv = server("kernels-err");

    let r = call_json(&srv.app, "POST", "/kernels", json!({"name": "no-such-spec"})).await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    assert_eq!(r.json()["kind"], "UnknownKernel");

    let r = send(
        &srv.app,
        "POST",
        "/kernels",
        Some(TOKEN),
        Some(("application/json", "{not json".into())),
    )
    .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");

    for (method, uri) in [
        ("GET", "/kernels/missing"),
        ("DELETE", "/kernels/missing"),
        ("POST", "/kernels/missing/interrupt"),
        ("POST", "/kernels/missing/restart"),
        ("POST", "/kernels/missing/attach"),
        ("GET", "/kernels/missing/events"),
    ] {
        let r = call(&srv.app, method, uri).await;
        assert_eq!(r.status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(r.json()["kind"], "NoSuchKernel", "{method} {uri}");
    }
}

#[tokio::test]
async fn test_kernelspecs_lists_configured_and_builtin() {
    let srv = server("specs");
    let r = call(&srv.app, "GET", "/kernelspecs").await;
    assert_eq!(r.status, StatusCode::OK);
    let body = r.json();
    assert_eq!(body["default"], "spyder-kernel");
    assert_eq!(
        body["kernelspecs"]["spyder-kernel"]["display_name"],
        "Fake Spyder kernel"
    );
}

#[tokio::test]
async fn test_files_write_read_list_stat_delete() {
    let srv = server("files");

    let r = call_json(
        &srv.app,
        "PUT",
        "/files/proj/notes.txt",
        json!({"content": "hello", "create_dirs": true, "mode": "0600"}),
    )
    .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json()["size"], 5);

    let r = call(&srv.app, "GET", "/files/proj/notes.txt").await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json()["content"], "hello");
    assert!(r.json()["encoding"].is_null());

    let r = call(&srv.app, "GET", "/files/~/proj/notes.txt?info=true").await;
    let info = r.json();
    assert_eq!(info["name"], "notes.txt");
    assert_eq!(info["type"], "file");
    assert_eq!(info["mode"], "0600");
    assert_eq!(info["islink"], false);

    let r = call_json(
        &srv.app,
        "PUT",
        "/files/proj/blob.bin",
        json!({"content": "AP8=", "encoding": "base64"}),
    )
    .await;
    assert_eq!(r.status, StatusCode::OK);
    let r = call(&srv.app, "GET", "/files/proj/blob.bin").await;
    assert_eq!(r.json()["encoding"], "base64");
    assert_eq!(r.json()["content"], "AP8=");

    let r = call(&srv.app, "GET", "/files/proj").await;
    let names: Vec<String> = r.json()["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["blob.bin", "notes.txt"]);

    let r = call(&srv.app, "GET", "/files").await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json()["entries"][0]["name"], "proj");
    assert_eq!(r.json()["entries"][0]["type"], "dir");

    let r = call(&srv.app, "DELETE", "/files/proj/notes.txt").await;
    assert_eq!(r.status, StatusCode::NO_CONTENT);
    let r = call(&srv.app, "DELETE", "/files/proj/notes.txt").await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    let r = call(&srv.app, "DELETE", "/files/proj/notes.txt?missing_ok=true").await;
    assert_eq!(r.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_files_operations() {
    let srv = server("files-ops");

    let r = call_json(&srv.app, "POST", "/files/a/b/c", json!({"op": "mkdir"})).await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    let r = call_json(
        &srv.app,
        "POST",
        "/files/a/b/c",
        json!({"op": "mkdir", "parents": true}),
    )
    .await;
    assert_eq!(r.status, StatusCode::CREATED);
    let r = call_json(&srv.app, "POST", "/files/a/b/c", json!({"op": "mkdir"})).await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.json()["kind"], "AlreadyExists");
    let r = call_json(
        &srv.app,
        "POST",
        "/files/a/b/c",
        json!({"op": "mkdir", "exist_ok": true}),
    )
    .await;
    assert_eq!(r.status, StatusCode::CREATED);

    let r = call_json(&srv.app, "POST", "/files/a/empty.py", json!({"op": "touch"})).await;
    assert_eq!(r.status, StatusCode::CREATED);
    let r = call(&srv.app, "GET", "/files/a/empty.py").await;
    assert_eq!(r.json()["size"], 0);

    call_json(&srv.app, "PUT", "/files/a/src.txt", json!({"content": "data"})).await;
    let r = call_json(
        &srv.app,
        "POST",
        "/files/a/src.txt",
        json!({"op": "copy", "destination": "a/dst.txt"}),
    )
    .await;
    assert_eq!(r.status, StatusCode::CREATED);
    let r = call(&srv.app, "GET", "/files/a/dst.txt").await;
    assert_eq!(r.json()["content"], "data");

    // Non-empty directories are not removed.
    let r = call(&srv.app, "DELETE", "/files/a/b").await;
    assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
    let r = call(&srv.app, "DELETE", "/files/a/b/c").await;
    assert_eq!(r.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_files_outside_root_are_forbidden() {
    let srv = server("files-escape");
    let outside = srv.dir.join("secret.txt");
    std::fs::write(&outside, "s3cret").unwrap();
    std::os::unix::fs::symlink(&srv.dir, srv.dir.join("home/link")).unwrap();

    for uri in ["/files/../secret.txt", "/files/link/secret.txt"] {
        let r = call(&srv.app, "GET", uri).await;
        assert_eq!(r.status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(r.json()["kind"], "PathForbidden");
    }
    let r = call_json(
        &srv.app,
        "PUT",
        "/files/link/planted.txt",
        json!({"content": "x"}),
    )
    .await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);
    assert!(!srv.dir.join("planted.txt").exists());

    // Removing the link itself is fine; its target is untouched.
    let r = call(&srv.app, "DELETE", "/files/link").await;
    assert_eq!(r.status, StatusCode::NO_CONTENT);
    assert!(outside.exists());

    // Dangling links are judged by where they point.
    let home = srv.dir.join("home");
    std::os::unix::fs::symlink("../outside_touch.txt", home.join("t")).unwrap();
    std::os::unix::fs::symlink("../outside_copy.txt", home.join("c")).unwrap();
    std::fs::write(home.join("src.txt"), "payload").unwrap();

    let r = call_json(&srv.app, "POST", "/files/t", json!({"op": "touch"})).await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);
    assert_eq!(r.json()["kind"], "PathForbidden");
    assert!(!srv.dir.join("outside_touch.txt").exists());

    let r = call_json(
        &srv.app,
        "POST",
        "/files/src.txt",
        json!({"op": "copy", "destination": "c"}),
    )
    .await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);
    assert!(!srv.dir.join("outside_copy.txt").exists());

    let r = call_json(&srv.app, "PUT", "/files/t", json!({"content": "x"})).await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);
    assert!(!srv.dir.join("outside_touch.txt").exists());

    // A dangling link that stays inside the root is usable.
    std::os::unix::fs::symlink("made.txt", home.join("inner")).unwrap();
    let r = call_json(&srv.app, "POST", "/files/inner", json!({"op": "touch"})).await;
    assert_eq!(r.status, StatusCode::CREATED, "{}", r.text());
    assert!(home.join("made.txt").exists());
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let srv = server("malformed");
    let form = Some((
        "application/x-www-form-urlencoded",
        "nope=1".to_string(),
    ));
    let r = send(&srv.app, "POST", "/environ/SRS_MALFORMED", Some(TOKEN), form).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");
    assert!(r.json()["error"].as_str().unwrap().contains("value"));
    assert!(srv.state.environ.get("SRS_MALFORMED").is_none());

    let r = call_json(&srv.app, "PUT", "/files/x.txt", json!({"oops": 1})).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");
    assert!(!srv.dir.join("home/x.txt").exists());

    let r = call_json(&srv.app, "POST", "/files/d", json!({"op": "explode"})).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");

    let r = send(
        &srv.app,
        "PUT",
        "/files/x.txt",
        Some(TOKEN),
        Some(("application/json", "{not json".to_string())),
    )
    .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");

    let r = call(&srv.app, "GET", "/files?list=maybe").await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");

    let r = call(&srv.app, "DELETE", "/kernels/abc?now=soon").await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");

    let r = call_json(&srv.app, "POST", "/envs", json!({"packages": []})).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.json()["kind"], "InvalidRequest");
}

#[tokio::test]
async fn test_envs_without_manager_is_config_error() {
    let srv = server("envs-missing");
    let r = call(&srv.app, "GET", "/envs").await;
    assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(r.json()["kind"], "ConfigError");
}

#[tokio::test]
async fn test_shutdown_notifies() {
    let srv = server("shutdown");
    let notified = srv.state.shutdown.clone();
    let r = call(&srv.app, "POST", "/shutdown").await;
    assert_eq!(r.status, StatusCode::ACCEPTED);
    tokio::time::timeout(std::time::Duration::from_secs(1), notified.notified())
        .await
        .unwrap();
}
