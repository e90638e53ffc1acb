//! End-to-end tests against the in-process server
//!
//! Each test starts its own server with a `texttab` table holding one row:
//! an int key, a text field and a float.
//!
//! Run with: cargo test --test integration_tests

use std::time::Duration;

use bytes::Bytes;
use rowproto::constants::{msg_number, ResultKind};
use rowproto::server::{ProcResult, ResultSet, Server, ServerConfig, ServerError, ServerHandle};
use rowproto::{
    CancelScope, CommandIo, CommandSession, Config, Connection, DataFormat, DataType, Discard,
    Error, FieldTarget, Flow, Outcome, ReadStatus, ResultHandler, Stage, Submission,
    TrailingValue, UpdateOrchestrator, UpdateState, Validation, Value,
};

const INITIAL: &str = "This is the initial value of the text field";
const FIRST_UPDATE: &str = "This is the text value after the first update";
const SECOND_UPDATE: &str = "A second writer got there first";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a server named `name` with a seeded `texttab`
async fn start_server(name: &str) -> ServerHandle {
    init_tracing();
    let server = Server::new(ServerConfig::new(name).grace_period(Duration::from_millis(200)))
        .start()
        .await
        .expect("Failed to start server");
    server
        .create_table(
            "texttab",
            vec![
                DataFormat::new("i1", DataType::Int),
                DataFormat::new("t1", DataType::Text),
                DataFormat::new("f1", DataType::Float),
            ],
        )
        .expect("Failed to create table");
    server
        .insert_row(
            "texttab",
            vec![
                Value::Integer(35),
                Value::Text(Bytes::from_static(INITIAL.as_bytes())),
                Value::Float(20.3),
            ],
        )
        .expect("Failed to seed table");
    server
}

fn config(server: &ServerHandle) -> Config {
    Config::new(server.name(), "sa", "")
}

async fn connect(server: &ServerHandle) -> Connection {
    Connection::connect(&server.connector(), config(server))
        .await
        .expect("Failed to connect")
}

fn target() -> FieldTarget {
    FieldTarget::new("texttab", 0, 1)
        .and_then(|t| t.with_trailing(&[2]))
        .unwrap()
}

async fn stop(server: ServerHandle) {
    server.stop();
    server.wait_stopped().await;
}

mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_login_is_echoed() {
        let server = start_server("echo_login").await;
        let mut conn = connect(&server).await;

        let greeting = &conn.messages()[0];
        assert_eq!(greeting.number, msg_number::LOGIN_ECHO);
        assert_eq!(greeting.text, "User 'sa' logged in.");
        assert_eq!(greeting.server_name, "echo_login");

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_language_command_is_echoed() {
        let server = start_server("echo_command").await;
        let mut conn = connect(&server).await;
        conn.take_messages();

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("select * from texttab"), &mut Discard)
            .await;
        assert!(outcome.is_success());

        let echo = conn
            .messages()
            .iter()
            .find(|m| m.number == msg_number::COMMAND_ECHO)
            .expect("no echo");
        assert_eq!(
            echo.text,
            "Language handler called with string 'select * from texttab'."
        );
        stop(server).await;
    }

    #[tokio::test]
    async fn test_unknown_server_is_unavailable() {
        let server = start_server("known").await;
        let result = Connection::connect(&server.connector(), Config::new("other", "sa", "")).await;
        assert!(matches!(result, Err(Error::ServerUnavailable(_))));
        stop(server).await;
    }

    #[tokio::test]
    async fn test_orphaned_command_is_released() {
        let server = start_server("orphan").await;
        let mut conn = connect(&server).await;
        {
            let mut cmd = conn.command().await.unwrap();
            cmd.language("select * from texttab").await.unwrap();
            cmd.send().await.unwrap();
            assert_eq!(cmd.next_result().await.unwrap(), Some(ResultKind::Row));
        }

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("select * from texttab"), &mut Discard)
            .await;
        assert!(outcome.is_success());
        stop(server).await;
    }
}

mod update_tests {
    use super::*;

    #[tokio::test]
    async fn test_update_cycle() {
        let server = start_server("update_cycle").await;
        let config = config(&server);
        let mut reader = connect(&server).await;
        let mut writer = connect(&server).await;
        let mut update = UpdateOrchestrator::new(target(), &config).unwrap();

        let report = update
            .update(
                reader.command().await.unwrap(),
                writer.command().await.unwrap(),
                Some(INITIAL.as_bytes()),
                FIRST_UPDATE,
            )
            .await
            .unwrap();

        assert_eq!(report.before.key, Value::Integer(35));
        assert_eq!(report.before.text(), INITIAL);
        assert_eq!(report.before.status, ReadStatus::Complete);
        assert_eq!(
            report.before.trailing,
            vec![TrailingValue {
                column: 2,
                value: Value::Float(20.3),
                status: ReadStatus::Complete,
            }]
        );
        assert!(report.before.is_complete());
        assert_eq!(report.validation, Some(Validation::Matched));
        assert_ne!(report.descriptor.version(), report.before.descriptor.version());
        assert_eq!(report.descriptor.location(), report.before.descriptor.location());
        assert_eq!(update.state(), UpdateState::Idle);

        assert_eq!(
            server.value("texttab", 0, 1),
            Some(Value::Text(Bytes::from_static(FIRST_UPDATE.as_bytes())))
        );
        assert_eq!(
            server.version("texttab", 0, 1).as_deref(),
            Some(report.descriptor.version())
        );

        let after = update.read(reader.command().await.unwrap()).await.unwrap();
        assert_eq!(after.text(), FIRST_UPDATE);
        assert_eq!(after.descriptor.version(), report.descriptor.version());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_update_is_logged() {
        let server = start_server("change_log").await;
        let config = config(&server);
        let mut conn = connect(&server).await;
        let mut update = UpdateOrchestrator::new(target(), &config).unwrap();

        let before = update.read(conn.command().await.unwrap()).await.unwrap();
        let written = update
            .write(conn.command().await.unwrap(), before.descriptor, FIRST_UPDATE)
            .await
            .unwrap();

        let log = server.change_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].table, "texttab");
        assert_eq!((log[0].row, log[0].column), (0, 1));
        assert_eq!(log[0].length, FIRST_UPDATE.len());
        assert_eq!(log[0].version.as_ref(), written.version());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_stale_descriptor_is_rejected() {
        let server = start_server("stale").await;
        let config = config(&server);
        let mut first = connect(&server).await;
        let mut second = connect(&server).await;
        let mut a = UpdateOrchestrator::new(target(), &config).unwrap();
        let mut b = UpdateOrchestrator::new(target(), &config).unwrap();

        let seen_by_a = a.read(first.command().await.unwrap()).await.unwrap();
        let seen_by_b = b.read(second.command().await.unwrap()).await.unwrap();
        b.write(second.command().await.unwrap(), seen_by_b.descriptor, SECOND_UPDATE)
            .await
            .unwrap();

        let failure = a
            .write(
                first.command().await.unwrap(),
                seen_by_a.descriptor.clone(),
                FIRST_UPDATE,
            )
            .await
            .unwrap_err();
        assert_eq!(failure.state, UpdateState::Writing);
        match failure.error {
            Error::StaleVersion { location } => {
                assert_eq!(location, seen_by_a.descriptor.location_hex())
            }
            other => panic!("expected a stale version, got {other:?}"),
        }
        assert_eq!(
            server.value("texttab", 0, 1),
            Some(Value::Text(Bytes::from_static(SECOND_UPDATE.as_bytes())))
        );

        // Re-reading picks up the current version and the write goes through
        let fresh = a.read(first.command().await.unwrap()).await.unwrap();
        assert_eq!(fresh.text(), SECOND_UPDATE);
        a.write(first.command().await.unwrap(), fresh.descriptor, FIRST_UPDATE)
            .await
            .unwrap();
        stop(server).await;
    }

    #[tokio::test]
    async fn test_small_capacity_truncates() {
        let server = start_server("truncate").await;
        let config = config(&server).field_capacity(10);
        let mut conn = connect(&server).await;
        let mut update = UpdateOrchestrator::new(target(), &config).unwrap();

        let snapshot = update.read(conn.command().await.unwrap()).await.unwrap();
        assert_eq!(snapshot.status, ReadStatus::Truncated);
        assert_eq!(snapshot.value.as_ref(), &INITIAL.as_bytes()[..10]);

        let validation = update.validate(&snapshot, INITIAL.as_bytes());
        assert!(!validation.is_match());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_trailing_char_truncation_is_reported() {
        let server = start_server("trailing_char").await;
        server
            .create_table(
                "chartab",
                vec![
                    DataFormat::new("i1", DataType::Int),
                    DataFormat::new("t1", DataType::Text),
                    DataFormat::new("c1", DataType::Char),
                ],
            )
            .unwrap();
        let split_char = format!("{}é", "a".repeat(63));
        let long_ascii = "b".repeat(100);
        for (key, trailing) in [(1, &split_char), (2, &long_ascii)] {
            server
                .insert_row(
                    "chartab",
                    vec![
                        Value::Integer(key),
                        Value::Text(Bytes::from_static(INITIAL.as_bytes())),
                        Value::Char(trailing.clone()),
                    ],
                )
                .unwrap();
        }

        let config = config(&server).field_capacity(64);
        let target = FieldTarget::new("chartab", 0, 1)
            .and_then(|t| t.with_trailing(&[2]))
            .unwrap();
        let mut update = UpdateOrchestrator::new(target, &config).unwrap();
        let mut conn = connect(&server).await;
        let rows = update.read_all(conn.command().await.unwrap()).await.unwrap();
        assert_eq!(rows.len(), 2);

        for row in &rows {
            assert_eq!(row.text(), INITIAL);
            assert_eq!(row.status, ReadStatus::Complete);
            assert!(row.descriptor.is_initialized());
            assert_eq!(row.trailing[0].status, ReadStatus::Truncated);
            assert!(!row.is_complete());
        }
        assert_eq!(rows[0].trailing[0].value, Value::Char("a".repeat(63)));
        assert_eq!(rows[1].trailing[0].value, Value::Char("b".repeat(64)));

        // A column short enough for the buffer is read whole
        let roomy = config.field_capacity(255);
        let target = FieldTarget::new("chartab", 0, 1)
            .and_then(|t| t.with_trailing(&[2]))
            .unwrap();
        let mut update = UpdateOrchestrator::new(target, &roomy).unwrap();
        let row = update.read(conn.command().await.unwrap()).await.unwrap();
        assert_eq!(row.trailing[0].value, Value::Char(split_char));
        assert!(row.is_complete());
        stop(server).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_connections() {
        let server = start_server("concurrent").await;
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                let config = config(&server);
                let mut conn = connect(&server).await;
                let mut update = UpdateOrchestrator::new(target(), &config).unwrap();
                for _ in 0..5 {
                    let snapshot = update.read(conn.command().await.unwrap()).await.unwrap();
                    assert_eq!(snapshot.text(), INITIAL);
                }
                conn.close().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        stop(server).await;
    }
}

mod result_stream_tests {
    use super::*;

    /// Fetches every row, failing on the `fail_at`-th row result set
    struct Collect {
        rows: Vec<Value>,
        row_sets: usize,
        fail_at: Option<usize>,
    }

    impl Collect {
        fn new() -> Self {
            Self {
                rows: Vec::new(),
                row_sets: 0,
                fail_at: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl ResultHandler for Collect {
        async fn on_row(&mut self, cmd: &mut dyn CommandIo) -> rowproto::Result<Flow> {
            self.row_sets += 1;
            if self.fail_at == Some(self.row_sets) {
                return Err(Error::Internal("handler gave up".to_string()));
            }
            let format = cmd.describe(0).await?;
            cmd.bind(0, &format).await?;
            while let Some(row) = cmd.fetch().await? {
                self.rows.extend(row.get(0).cloned());
            }
            Ok(Flow::Continue)
        }
    }

    fn int_rows(values: &[i64]) -> ResultSet {
        ResultSet::rows(
            vec![DataFormat::new("n", DataType::Int)],
            values.iter().map(|&v| vec![Value::Integer(v)]).collect(),
        )
    }

    #[tokio::test]
    async fn test_status_does_not_end_the_stream() {
        let server = start_server("status").await;
        server
            .register_procedure("report", |_| {
                Ok(ProcResult::empty()
                    .with_set(int_rows(&[1, 2]))
                    .with_set(ResultSet::status(0))
                    .with_set(int_rows(&[3])))
            })
            .unwrap();
        let mut conn = connect(&server).await;

        let mut handler = Collect::new();
        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec report"), &mut handler)
            .await;
        assert!(outcome.is_success());
        assert_eq!(
            handler.rows,
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
        stop(server).await;
    }

    #[tokio::test]
    async fn test_unclassified_unit_cancels_remaining_results() {
        let server = start_server("unclassified").await;
        server
            .register_procedure("odd", |_| {
                Ok(ProcResult::empty()
                    .with_set(int_rows(&[1]))
                    .with_set(ResultSet::bare(ResultKind::Describe))
                    .with_set(int_rows(&[2])))
            })
            .unwrap();
        let mut conn = connect(&server).await;

        let mut handler = Collect::new();
        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec odd"), &mut handler)
            .await;
        assert!(outcome.is_success());
        assert_eq!(handler.rows, vec![Value::Integer(1)]);
        assert_eq!(handler.row_sets, 1);
        stop(server).await;
    }

    #[tokio::test]
    async fn test_handler_failure_cancels_and_frees_the_handle() {
        let server = start_server("handler_failure").await;
        server
            .register_procedure("four", |_| {
                Ok(ProcResult::empty()
                    .with_set(int_rows(&[1]))
                    .with_set(int_rows(&[2]))
                    .with_set(int_rows(&[3]))
                    .with_set(int_rows(&[4])))
            })
            .unwrap();
        let mut conn = connect(&server).await;

        let mut handler = Collect::new();
        handler.fail_at = Some(2);
        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec four"), &mut handler)
            .await;
        assert_eq!(outcome.stage(), Some(Stage::Results));
        assert_eq!(handler.rows, vec![Value::Integer(1)]);

        // The connection is usable again
        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec four"), &mut Collect::new())
            .await;
        assert!(outcome.is_success());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_failed_command_reports_server_message() {
        let server = start_server("cmd_fail").await;
        let mut conn = connect(&server).await;

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("select * from missing"), &mut Discard)
            .await;
        match outcome {
            Outcome::Failed {
                stage: Stage::Results,
                error: Error::CommandFailed { number, .. },
            } => assert_eq!(number, Some(msg_number::UNKNOWN_OBJECT)),
            other => panic!("unexpected outcome {other:?}"),
        }
        stop(server).await;
    }

    #[tokio::test]
    async fn test_retrieval_order_is_enforced() {
        let server = start_server("retrieval_order").await;
        let mut conn = connect(&server).await;
        let mut cmd = conn.command().await.unwrap();
        cmd.language("select * from texttab").await.unwrap();
        cmd.send().await.unwrap();
        assert_eq!(cmd.next_result().await.unwrap(), Some(ResultKind::Row));

        let key = cmd.describe(0).await.unwrap();
        cmd.bind(0, &key).await.unwrap();
        assert!(cmd.fetch().await.unwrap().is_some());

        let err = cmd.get_descriptor(1).await.unwrap_err();
        assert!(matches!(err, Error::Server { number, .. } if number == msg_number::NOT_CURRENT_ITEM));
        let err = cmd.get_chunk(0, 5).await.unwrap_err();
        assert!(matches!(err, Error::Server { number, .. } if number == msg_number::BIND_ORDER));

        cmd.get_chunk(2, 8).await.unwrap();
        let err = cmd.get_chunk(1, 5).await.unwrap_err();
        assert!(matches!(err, Error::Server { number, .. } if number == msg_number::BIND_ORDER));

        cmd.cancel(CancelScope::All).await.unwrap();
        cmd.release().await.unwrap();
        stop(server).await;
    }
}

mod server_tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_procedure_stops_the_server() {
        let server = start_server("stop_proc").await;
        let mut conn = connect(&server).await;

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec stop_srv"), &mut Discard)
            .await;
        assert!(outcome.is_success());

        server.wait_stopped().await;
        assert!(server.is_stopped());
        let result = Connection::connect(&server.connector(), config(&server)).await;
        assert!(matches!(result, Err(Error::ServerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fatal_session_error_ends_only_that_session() {
        let server = start_server("fatal_process").await;
        server
            .register_procedure("crash", |_| Err(ServerError::fatal_process("session crashed")))
            .unwrap();
        let mut conn = connect(&server).await;

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec crash"), &mut Discard)
            .await;
        assert_eq!(outcome.stage(), Some(Stage::Submit));
        assert!(outcome.error().is_some_and(Error::is_connection_error));

        assert!(!server.is_stopping());
        let mut other = connect(&server).await;
        let outcome = CommandSession::new(other.command().await.unwrap(), Default::default())
            .run(Submission::language("select * from texttab"), &mut Discard)
            .await;
        assert!(outcome.is_success());
        stop(server).await;
    }

    #[tokio::test]
    async fn test_fatal_server_error_stops_the_server() {
        let server = start_server("fatal_server").await;
        server
            .register_procedure("meltdown", |_| Err(ServerError::fatal_server("out of memory")))
            .unwrap();
        let mut conn = connect(&server).await;

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec meltdown"), &mut Discard)
            .await;
        assert!(!outcome.is_success());

        server.wait_stopped().await;
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn test_procedure_error_fails_the_command() {
        let server = start_server("proc_error").await;
        server
            .register_procedure("picky", |ctx| {
                if ctx.args.is_empty() {
                    Err(ServerError::error(msg_number::UNKNOWN_COMMAND, "picky needs an argument"))
                } else {
                    Ok(ProcResult::empty().with_status(ctx.args.len() as i64))
                }
            })
            .unwrap();
        let mut conn = connect(&server).await;

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec picky"), &mut Discard)
            .await;
        assert!(matches!(
            outcome.error(),
            Some(Error::CommandFailed { message: Some(m), .. }) if m == "picky needs an argument"
        ));

        let outcome = CommandSession::new(conn.command().await.unwrap(), Default::default())
            .run(Submission::language("exec picky a b"), &mut Discard)
            .await;
        assert!(outcome.is_success());
        stop(server).await;
    }
}
