#[cfg(unix)]
mod e2e {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use wpx_core::fork_options::DaemonForkOptions;
    use wpx_core::loader::{
        ClassLoader, DirectoryTypeSource, ILLEGAL_ARGUMENT_CLASS, ILLEGAL_STATE_CLASS,
    };
    use wpx_core::protocol::{LogEvent, Severity};
    use wpx_core::stoppable::Stoppable;
    use wpx_core::request::{BuildOperationRef, Request};
    use wpx_core::value::{Object, Value};
    use wpx_core::WorkerError;
    use wpxd::config::CoordinatorConfig;
    use wpxd::manager::{DaemonManager, WorkerDaemonStarter};
    use wpxd::pool::DaemonStarter;

    fn tempdir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(working_dir: &Path) -> DaemonManager {
        let config = CoordinatorConfig {
            worker_executable: PathBuf::from(env!("CARGO_BIN_EXE_wpxw")),
            connect_timeout_ms: 10_000,
            stop_timeout_ms: 5_000,
            ..CoordinatorConfig::default()
        };
        config.validate().unwrap();
        DaemonManager::new(Arc::new(WorkerDaemonStarter::new(config)), working_dir)
    }

    fn request(method: &str, args: Vec<Value>) -> Request {
        let mut builder = Request::builder(method).build_operation(BuildOperationRef::new(1));
        for arg in args {
            builder = builder.arg(arg);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn echo_round_trips_through_worker() {
        let dir = tempdir("wpxw-echo");
        let manager = manager(&dir);
        let value = manager
            .execute("echo", &DaemonForkOptions::new(), request("echo", vec!["hello".into()]))
            .await
            .unwrap();
        assert_eq!(value, Value::Str("hello".into()));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn user_failure_keeps_class_and_worker() {
        let dir = tempdir("wpxw-fail");
        let manager = manager(&dir);
        let err = manager
            .execute("fail", &DaemonForkOptions::new(), request("fail", vec!["boom".into()]))
            .await
            .unwrap_err();
        let remote = err.remote().expect("remote failure");
        assert_eq!(remote.class_name(), ILLEGAL_STATE_CLASS);
        assert_eq!(remote.message, "boom");
        assert!(err.is_user_failure());
        assert_eq!(manager.pool("fail").idle_count(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_implementation_is_infrastructure_failure() {
        let dir = tempdir("wpxw-missing");
        let manager = manager(&dir);
        let err = manager
            .execute("no-such-thing", &DaemonForkOptions::new(), request("run", vec![]))
            .await
            .unwrap_err();
        let remote = err.remote().expect("remote failure");
        assert!(remote.is_infrastructure());
        assert_eq!(
            remote.message,
            "Failed to create worker implementation 'no-such-thing'"
        );
        assert_eq!(remote.causes().next().unwrap().class_name(), ILLEGAL_ARGUMENT_CLASS);
        assert!(!err.is_user_failure());
        assert_eq!(manager.pool("no-such-thing").idle_count(), 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn object_returns_bound_to_its_original_loader() {
        let dir = tempdir("wpxw-loader");
        let lib = dir.join("lib");
        let type_file = DirectoryTypeSource::type_file(&lib, "org.demo.Widget");
        std::fs::create_dir_all(type_file.parent().unwrap()).unwrap();
        std::fs::write(&type_file, "").unwrap();

        let manager = manager(&dir);
        let system = Arc::clone(manager.starter().system_loader());
        let client_loader = ClassLoader::client_owned(
            [lib.to_string_lossy().to_string()],
            vec![system],
            Arc::new(DirectoryTypeSource),
        );
        let widget = Object::new(client_loader.load_class("org.demo.Widget").unwrap())
            .with_field("size", 3i64);

        let opts = DaemonForkOptions::new();
        let echoed = manager
            .execute("echo", &opts, request("echo", vec![Value::Object(widget.clone())]))
            .await
            .unwrap();
        let echoed = echoed.as_object().unwrap();
        assert_eq!(echoed, &widget);
        assert!(Arc::ptr_eq(echoed.class.loader(), &client_loader));

        let classpath = manager
            .execute("echo", &opts, request("classpath", vec![Value::Object(widget)]))
            .await
            .unwrap();
        assert_eq!(classpath, Value::List(vec![Value::Str(lib.to_string_lossy().to_string())]));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn incompatible_options_start_a_second_worker() {
        let dir = tempdir("wpxw-pool");
        let manager = manager(&dir);
        let a = DaemonForkOptions::new()
            .with_heap(None, Some("512m"))
            .unwrap()
            .with_classpath(["x"]);
        let b = DaemonForkOptions::new()
            .with_heap(None, Some("256m"))
            .unwrap()
            .with_classpath(["x", "y"]);

        manager.execute("echo", &a, request("echo", vec![1i64.into()])).await.unwrap();
        manager.execute("echo", &b, request("echo", vec![2i64.into()])).await.unwrap();
        assert_eq!(manager.pool("echo").all_clients().len(), 2);

        let covered = DaemonForkOptions::new()
            .with_heap(None, Some("256m"))
            .unwrap()
            .with_classpath(["y"]);
        manager.execute("echo", &covered, request("echo", vec![3i64.into()])).await.unwrap();
        assert_eq!(manager.pool("echo").all_clients().len(), 2);
        assert_eq!(manager.pool("echo").idle_count(), 2);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn compiler_output_arrives_before_its_result() {
        let dir = tempdir("wpxw-compile");
        let manager = manager(&dir);
        let opts = DaemonForkOptions::new();
        let client = manager
            .pool("command-compiler")
            .reserve_new_client(&dir, &opts)
            .await
            .unwrap();
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&logs);
        client.add_log_listener(Arc::new(move |event: &LogEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let spec_class = manager
            .starter()
            .system_loader()
            .load_class("wpx.compile.CompileSpec")
            .unwrap();
        let spec = Object::new(spec_class).with_field("program", "sh").with_field(
            "args",
            Value::List(vec![
                "-c".into(),
                "echo 'warning: unused variable'; echo 'compiled 1 file'".into(),
            ]),
        );
        let result = client
            .execute(request("compile", vec![Value::Object(spec)]))
            .await
            .unwrap();
        let result = result.as_object().unwrap();
        assert_eq!(result.class.name(), "wpx.compile.WorkResult");
        assert_eq!(result.field("warnings"), Some(&Value::Int(1)));

        let problems = client.take_problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].severity, Severity::Warning);
        assert_eq!(problems[0].label, "unused variable");
        assert_eq!(problems[0].build_operation, BuildOperationRef::new(1));

        let logs = logs.lock().unwrap().clone();
        let compiled = logs
            .iter()
            .find(|event| event.message == "compiled 1 file")
            .expect("compiler output forwarded");
        assert_eq!(compiled.build_operation, Some(BuildOperationRef::new(1)));

        manager.pool("command-compiler").release(client);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn single_use_worker_answers_then_exits() {
        let dir = tempdir("wpxw-single");
        let manager = manager(&dir);
        let client = manager
            .starter()
            .start("echo", &dir, &DaemonForkOptions::new())
            .await
            .unwrap();
        let value = client
            .execute_then_stop(request("echo", vec!["last".into()]))
            .await
            .unwrap();
        assert_eq!(value, Value::Str("last".into()));
        assert!(client.has_exited().await);
        client.stop().await.unwrap();

        let value = manager
            .execute_single_use("echo", &DaemonForkOptions::new(), request("echo", vec![7i64.into()]))
            .await
            .unwrap();
        assert_eq!(value, Value::Int(7));
        assert!(manager.pool("echo").all_clients().is_empty());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_start_failure() {
        let dir = tempdir("wpxw-nobinary");
        let config = CoordinatorConfig {
            worker_executable: dir.join("does-not-exist"),
            ..CoordinatorConfig::default()
        };
        let manager = DaemonManager::new(Arc::new(WorkerDaemonStarter::new(config)), &dir);
        let err = manager
            .execute("echo", &DaemonForkOptions::new(), request("echo", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Start(_)));
        manager.stop().await.unwrap();
    }
}
