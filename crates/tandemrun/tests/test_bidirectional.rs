//! Two routers talking over an in-process channel pair.

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;

use tandemrpc::ErrorKind;
use tandemrun::Args;
use tandemrun::CallError;
use tandemrun::ChannelTransport;
use tandemrun::LedgerBuilder;
use tandemrun::Router;
use tandemrun::Service;

/// The long-lived backend object.
#[derive(Default)]
struct Kernel {
    annotations: Mutex<Vec<Value>>,
}

impl Service for Kernel {
    fn expose(ledger: &mut LedgerBuilder<Self>) {
        ledger.method("add_annotation")
            .required("ann_type")
            .required("coords")
            .optional("meta", json!({}))
            .handler(|kernel, args| {
                let annotation = json!({
                    "type": args.get::<String>("ann_type")?,
                    "coords": args.value("coords"),
                    "meta": args.value("meta"),
                });
                let mut annotations = kernel.annotations.lock()
                    .map_err(|_| anyhow::anyhow!("annotation store poisoned"))?;
                annotations.push(annotation);
                Ok(json!(annotations.len()))
            });
        ledger.method("echo")
            .required("value")
            .handler(|_, args| Ok(args.value("value").cloned().unwrap_or(Value::Null)));
    }
}

/// The long-lived frontend object.
#[derive(Default)]
struct Viewer {
    center: Mutex<Option<(f64, f64)>>,
}

impl Service for Viewer {
    fn expose(ledger: &mut LedgerBuilder<Self>) {
        ledger.method("set_center")
            .required("x")
            .required("y")
            .handler(|viewer, args| {
                let center: (f64, f64) = (args.get("x")?, args.get("y")?);
                *viewer.center.lock().map_err(|_| anyhow::anyhow!("viewer state poisoned"))? = Some(center);
                Ok(Value::Null)
            });
        ledger.method("zoom")
            .optional("factor", 2)
            .handler(|_, args| Ok(json!(args.get::<i64>("factor")? * 10)));
    }
}

struct Session {
    kernel: Arc<Kernel>,
    viewer: Arc<Viewer>,
    backend: Arc<Router>,
    frontend: Arc<Router>,
}

async fn session() -> Session {
    let (back, front) = ChannelTransport::pair();
    let kernel = Arc::new(Kernel::default());
    let viewer = Arc::new(Viewer::default());

    let backend = Arc::new(Router::builder().expose(kernel.clone()).build(back.clone()).unwrap());
    let frontend = Arc::new(Router::builder().expose(viewer.clone()).build(front.clone()).unwrap());

    backend.serve(back);
    frontend.serve(front);

    backend.announce().unwrap();
    frontend.announce().unwrap();

    backend.wait_for_remote().await;
    frontend.wait_for_remote().await;

    Session { kernel, viewer, backend, frontend }
}

#[tokio::test]
async fn test_protocols_are_exchanged() {
    let s = session().await;

    let kernel_side = s.frontend.remote().unwrap();
    let names: Vec<_> = kernel_side.procedures().map(|p| p.name()).collect();
    assert_eq!(names, vec!["add_annotation", "echo"]);

    let viewer_side = s.backend.remote().unwrap();
    assert_eq!(viewer_side.protocol(), &s.frontend.protocol());
}

#[tokio::test]
async fn test_calls_flow_both_ways() {
    let s = session().await;

    let to_kernel = s.frontend.remote().unwrap();
    let count = to_kernel
        .call("add_annotation", Args::new().arg("point").arg(json!([1.0, 2.0])))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(count, json!(1));

    let to_viewer = s.backend.remote().unwrap();
    let done = to_viewer
        .call("set_center", Args::new().arg(4.5).arg(-1.0))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(done, Value::Null);

    assert_eq!(*s.viewer.center.lock().unwrap(), Some((4.5, -1.0)));
    assert_eq!(s.kernel.annotations.lock().unwrap()[0], json!({
        "type": "point",
        "coords": [1.0, 2.0],
        "meta": {},
    }));
}

#[tokio::test]
async fn test_keyword_and_default_cross_the_wire() {
    let s = session().await;
    let to_viewer = s.backend.remote().unwrap();

    let defaulted = to_viewer.call("zoom", Args::new()).unwrap().await.unwrap();
    let supplied = to_viewer.call("zoom", Args::new().kwarg("factor", 3)).unwrap().await.unwrap();

    assert_eq!(defaulted, json!(20));
    assert_eq!(supplied, json!(30));
}

#[tokio::test]
async fn test_concurrent_calls_correlate() {
    let s = session().await;
    let to_kernel = s.frontend.remote().unwrap();

    let calls: Vec<_> = (0..20)
        .map(|i| to_kernel.call("echo", Args::new().arg(i)).unwrap())
        .collect();

    for (i, call) in calls.into_iter().enumerate().rev() {
        assert_eq!(call.await.unwrap(), json!(i));
    }
    assert!(s.frontend.pending().is_empty());
}

#[tokio::test]
async fn test_remote_failure_is_rejected() {
    let s = session().await;
    let to_kernel = s.frontend.remote().unwrap();

    let err = to_kernel
        .call("add_annotation", Args::new().arg(7).arg(json!([])))
        .unwrap()
        .await
        .unwrap_err();

    let CallError::Remote(payload) = err else {
        panic!("expected a remote rejection, got {err:?}");
    };
    assert_eq!(payload.kind(), Some(ErrorKind::InvalidParams));
}

#[tokio::test]
async fn test_notification_runs_without_reply() {
    let s = session().await;
    let to_kernel = s.frontend.remote().unwrap();

    to_kernel.notify("add_annotation", Args::new().arg("line").arg(json!([[0, 0], [1, 1]]))).unwrap();
    // a round trip on the same channel orders after the notification
    to_kernel.call("echo", Args::new().arg("sync")).unwrap().await.unwrap();

    assert_eq!(s.kernel.annotations.lock().unwrap().len(), 1);
    assert!(s.frontend.pending().is_empty());
}

#[tokio::test]
async fn test_callback_form() {
    let s = session().await;
    let to_kernel = s.frontend.remote().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    to_kernel.call_with("echo", Args::new().arg("cb"), move |reply| {
        let _ = tx.send(reply);
    }).unwrap();

    assert_eq!(rx.await.unwrap(), Ok(json!("cb")));
}

#[tokio::test]
async fn test_closing_channel_rejects_pending() {
    let (back, front) = ChannelTransport::pair();
    let backend = Arc::new(Router::builder().build(back.clone()).unwrap());
    let remote = backend.connect(tandemrpc::Protocol::new(vec![
        tandemrpc::ProcedureDescriptor::new("never_answered"),
    ]).unwrap());

    let pump = backend.serve(back);
    let call = remote.call("never_answered", Args::new()).unwrap();
    drop(front);

    assert_eq!(call.await, Err(CallError::Closed { procedure: "never_answered".into() }));
    pump.await.unwrap();
    assert!(backend.pending().is_empty());
}

#[tokio::test]
async fn test_pump_survives_peer_errors_and_failing_callbacks() {
    use tandemrun::Inbound;
    use tandemrun::Outbound;

    let (back, peer) = ChannelTransport::pair();
    let backend = Arc::new(Router::builder().build(back.clone()).unwrap());
    let remote = backend.connect(tandemrpc::Protocol::new(vec![
        tandemrpc::ProcedureDescriptor::new("lookup").with_required("key"),
    ]).unwrap());
    let pump = backend.serve(back);

    let callback_id = remote.call_with("lookup", Args::new().arg("a"), |_| panic!("callback blew up")).unwrap();
    let failing = remote.call("lookup", Args::new().arg("b")).unwrap();
    let working = remote.call("lookup", Args::new().arg("c")).unwrap();

    // the peer answers with plain JSON-RPC error objects, as a browser client does
    peer.send(json!({"result": 1, "error": null, "id": callback_id})).unwrap();
    peer.send(json!({"result": null, "error": {"code": -32602, "message": "no such key"}, "id": failing.id()})).unwrap();
    peer.send(json!({"result": "found", "error": null, "id": working.id()})).unwrap();

    let CallError::Remote(payload) = failing.await.unwrap_err() else {
        panic!("expected a remote rejection");
    };
    assert_eq!(payload.kind(), Some(ErrorKind::InvalidParams));
    assert_eq!(payload.message, "no such key");
    assert_eq!(working.await, Ok(json!("found")));

    // three requests went out, and the pump is still delivering
    for _ in 0..3 {
        peer.recv().await.unwrap().unwrap();
    }
    assert!(!pump.is_finished());
    assert!(backend.pending().is_empty());
}
