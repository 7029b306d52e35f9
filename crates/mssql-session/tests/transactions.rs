//! Transaction lifecycle scenarios against the scripted mock server.

use std::time::Duration;

use mssql_session::{Session, SessionError, SessionStatus, TransactionState};
use mssql_mock::{MockTdsServer, ScriptStep, TokenStreamBuilder};
use tds_wire::{IsolationLevel, PacketType, TmRequestKind};
use tokio::net::TcpStream;

async fn connect(server: &MockTdsServer) -> Session {
    let stream = TcpStream::connect(server.addr()).await.expect("connect");
    let session = Session::new(Box::new(stream));
    session.shared().set_logged_in(true);
    session
}

fn begin_response(descriptor: u64) -> bytes::Bytes {
    TokenStreamBuilder::new()
        .env_begin_transaction(descriptor)
        .done(0)
        .build()
}

fn done_only() -> bytes::Bytes {
    TokenStreamBuilder::new().done(0).build()
}

#[tokio::test]
async fn begin_commit_round_trip() {
    let commit_response = TokenStreamBuilder::new()
        .env_commit_transaction()
        .done(0)
        .build();

    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0xAB)),
        ScriptStep::ExpectTmRequest(TmRequestKind::Commit),
        ScriptStep::SendTokens(commit_response),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;

    let tx = session
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");
    assert_eq!(tx.isolation_level(), IsolationLevel::ReadCommitted);
    assert_eq!(tx.descriptor(), 0xAB);
    assert!(!tx.is_zombied());
    assert_eq!(session.transaction_descriptor(), 0xAB);

    tx.commit(&mut session).await.expect("commit");
    assert!(tx.is_zombied());
    assert_eq!(session.transaction_descriptor(), 0);

    // A second commit on the completed transaction throws.
    let err = tx.commit(&mut session).await.expect_err("second commit");
    assert!(matches!(err, SessionError::TransactionZombied));

    drop(session);
    server.finished().await.expect("script complete");
}

#[tokio::test]
async fn partial_zombie_commit_then_rollback() {
    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0xAB)),
        ScriptStep::ExpectTmRequest(TmRequestKind::Commit),
        // The env-change is delayed: the response carries only DONE.
        ScriptStep::SendTokens(done_only()),
        // Rollback in the partial-zombie window must stay off the wire.
        ScriptStep::ExpectSilence(Duration::from_millis(200)),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;

    let tx = session
        .begin_transaction(IsolationLevel::Serializable)
        .await
        .expect("begin");

    tx.commit(&mut session).await.expect("commit");
    // Outer callers observe a zombied handle while the internal
    // reference survives the window.
    assert!(tx.is_zombied());

    // The legacy partial-zombie rollback clears silently.
    tx.rollback(&mut session).await.expect("silent rollback");
    assert_eq!(tx.descriptor(), 0);
    assert_eq!(session.transaction_descriptor(), 0);

    // After the window is consumed, rollback throws like any other op.
    let err = tx.rollback(&mut session).await.expect_err("third op");
    assert!(matches!(err, SessionError::TransactionZombied));

    drop(session);
    server.finished().await.expect("no wire traffic after commit");
}

#[tokio::test]
async fn rollback_round_trip() {
    let rollback_response = TokenStreamBuilder::new()
        .env_rollback_transaction()
        .done(0)
        .build();

    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0x77)),
        ScriptStep::ExpectTmRequest(TmRequestKind::Rollback),
        ScriptStep::SendTokens(rollback_response),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;

    let tx = session
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");
    tx.rollback(&mut session).await.expect("rollback");
    assert!(tx.is_zombied());
    assert_eq!(session.transaction_descriptor(), 0);

    let err = tx.save(&mut session, "sp").await.expect_err("op on zombie");
    assert!(matches!(err, SessionError::TransactionZombied));

    drop(session);
    server.finished().await.expect("script complete");
}

#[tokio::test]
async fn savepoints_keep_transaction_active() {
    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0x11)),
        ScriptStep::ExpectTmRequest(TmRequestKind::Save),
        ScriptStep::SendTokens(done_only()),
        ScriptStep::ExpectTmRequest(TmRequestKind::Rollback),
        ScriptStep::SendTokens(done_only()),
        ScriptStep::ExpectTmRequest(TmRequestKind::Rollback),
        ScriptStep::SendTokens(
            TokenStreamBuilder::new()
                .env_rollback_transaction()
                .done(0)
                .build(),
        ),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;

    let tx = session
        .begin_transaction(IsolationLevel::RepeatableRead)
        .await
        .expect("begin");

    tx.save(&mut session, "before_items").await.expect("save");
    assert!(!tx.is_zombied());

    tx.rollback_to(&mut session, "before_items")
        .await
        .expect("rollback to savepoint");
    assert!(!tx.is_zombied());
    assert_eq!(session.transaction_descriptor(), 0x11);

    tx.rollback(&mut session).await.expect("full rollback");
    assert!(tx.is_zombied());

    drop(session);
    server.finished().await.expect("script complete");
}

#[tokio::test]
async fn empty_savepoint_name_is_rejected_without_wire_traffic() {
    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0x22)),
        ScriptStep::ExpectSilence(Duration::from_millis(150)),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;
    let tx = session
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");

    let err = tx.save(&mut session, "").await.expect_err("empty save");
    assert!(matches!(err, SessionError::NullEmptyTransactionName));
    let err = tx
        .rollback_to(&mut session, "")
        .await
        .expect_err("empty rollback target");
    assert!(matches!(err, SessionError::NullEmptyTransactionName));
    assert!(!tx.is_zombied());

    drop(session);
    server.finished().await.expect("no wire traffic for bad names");
}

#[tokio::test]
async fn commit_wait_timeout_aborts_connection() {
    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectTmRequest(TmRequestKind::Begin),
        ScriptStep::SendTokens(begin_response(0x33)),
        ScriptStep::ExpectTmRequest(TmRequestKind::Commit),
        // Never answer; the client's wait must expire.
        ScriptStep::Pause(Duration::from_millis(600)),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;
    let tx = session
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .expect("begin");

    session.shared().supervisor().set_timeout_ms(50);
    session
        .shared()
        .supervisor()
        .set_attention_grace(Duration::from_millis(100));

    let err = tx.commit(&mut session).await.expect_err("commit wait");
    assert!(matches!(err, SessionError::WaitTimeout));
    // The connection is aborted, never returned to a pool.
    assert_eq!(session.shared().status(), SessionStatus::Broken);

    drop(session);
    server.finished().await.expect("script complete");
}

#[tokio::test]
async fn tsql_begin_observed_in_batch_response() {
    // BEGIN TRANSACTION issued as raw SQL: the env-change creates a
    // LocalFromTsql transaction the session starts riding.
    let response = TokenStreamBuilder::new()
        .env_begin_transaction(0x5A)
        .done(0)
        .build();

    let server = MockTdsServer::start(vec![
        ScriptStep::ExpectMessage(PacketType::SqlBatch),
        ScriptStep::SendTokens(response),
        ScriptStep::WaitDisconnect,
    ])
    .await
    .expect("server start");

    let mut session = connect(&server).await;
    let batch = tds_wire::encode_sql_batch("BEGIN TRANSACTION", 0, 1);
    session
        .send_request(PacketType::SqlBatch, &batch, 1)
        .await
        .expect("send batch");
    let summary = session.process_until_done().await.expect("response");

    assert_eq!(summary.transaction_events.len(), 1);
    assert_eq!(session.transaction_descriptor(), 0x5A);
    let current = session.shared().registry().lock().current().expect("current");
    assert_eq!(current.state(), TransactionState::Active);

    drop(session);
    server.finished().await.expect("script complete");
}
