//! Session state machine tests driven through encoded requests.

use scopesync_core::{
    ColumnDescriptor, ColumnType, PrimaryKey, Replica, ReplicaConfig, RowState, ScopeId,
    ServerHistoryScopeInfo, SyncRow, SyncSetup, TableDescriptor, Value,
};
use scopesync_sync_protocol::{
    payload_hash, ChangesPart, ContextMessage, EndSessionRequest, EnsureScopesRequest, ErrorCode,
    EstimatedChangesRequest, GetChangesRequest, RequestHeaders, ScopeSummary, SendChangesRequest,
    SendChangesResponse, Serializer, ServerOperation, SessionId, SyncContext, SyncRequest,
    SyncResponse,
};
use scopesync_storage::{InMemoryBackend, StorageBackend};
use scopesync_sync_server::{MemorySessionStore, ServerConfig, SessionStore, SyncServer};
use std::sync::Arc;
use std::time::Duration;

fn replica() -> Arc<Replica> {
    let replica = Arc::new(Replica::in_memory(ReplicaConfig::new("server")).unwrap());
    replica
        .create_table(TableDescriptor::new(
            "items",
            vec![
                ColumnDescriptor::new("id", ColumnType::Integer),
                ColumnDescriptor::new("name", ColumnType::Text).nullable(),
            ],
            vec!["id".to_string()],
        ))
        .unwrap();
    replica
}

fn server_with(config: ServerConfig) -> SyncServer {
    let server = SyncServer::new(config, replica());
    server
        .register_scope("default", &SyncSetup::new(["items"]))
        .unwrap();
    server
}

fn server() -> SyncServer {
    server_with(ServerConfig::default())
}

fn item(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Integer(id), Value::Text(name.to_string())]
}

fn sync_row(id: i64, name: &str) -> SyncRow {
    SyncRow {
        values: item(id, name),
        state: RowState::Modified,
        timestamp: id as u64,
        update_scope_id: None,
    }
}

/// Drives one session by hand.
struct Client<'a> {
    server: &'a SyncServer,
    session: SessionId,
    client_id: ScopeId,
    serializer: Serializer,
}

impl<'a> Client<'a> {
    fn new(server: &'a SyncServer) -> Self {
        Self {
            server,
            session: SessionId::new(),
            client_id: ScopeId::new(),
            serializer: Serializer::Cbor,
        }
    }

    fn context(&self) -> SyncContext {
        SyncContext::new(self.session, "default", self.client_id)
    }

    fn send(&self, request: SyncRequest) -> (u16, SyncResponse) {
        let body = request.encode(self.serializer).unwrap();
        let headers =
            RequestHeaders::new(self.session, "default", self.serializer, request.step())
                .with_hash(payload_hash(&body));
        let response = self.server.handle_request(&headers, &body);
        assert_eq!(response.hash, payload_hash(&response.body));
        (
            response.status,
            self.serializer.decode(&response.body).unwrap(),
        )
    }

    fn ok(&self, request: SyncRequest) -> SyncResponse {
        let (status, response) = self.send(request);
        assert_eq!(status, 200, "unexpected failure: {response:?}");
        response
    }

    fn error_code(&self, request: SyncRequest) -> ErrorCode {
        match self.send(request) {
            (status, SyncResponse::Error(e)) => {
                assert_eq!(status, e.code.http_status());
                e.code
            }
            (_, other) => panic!("expected an error, got {other:?}"),
        }
    }

    fn open(&self, last_server_sync_timestamp: Option<u64>) -> ScopeSummary {
        match self.ok(SyncRequest::EnsureScopes(EnsureScopesRequest {
            context: self.context(),
            last_server_sync_timestamp,
        })) {
            SyncResponse::EnsureScopes(r) => r.scope,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn upload(
        &self,
        index: u32,
        is_last: bool,
        rows: Vec<SyncRow>,
        last_server_sync_timestamp: Option<u64>,
    ) -> SyncRequest {
        SyncRequest::SendChangesInProgress(SendChangesRequest {
            context: self.context(),
            last_server_sync_timestamp,
            batch_index: index,
            is_last_batch: is_last,
            table: "items".to_string(),
            rows,
        })
    }

    fn send_part(&self, request: SyncRequest) -> SendChangesResponse {
        match self.ok(request) {
            SyncResponse::SendChanges(r) => r,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn get_more(&self, index: u32) -> ChangesPart {
        match self.ok(SyncRequest::GetMoreChanges(GetChangesRequest {
            context: self.context(),
            batch_index: index,
        })) {
            SyncResponse::Changes(part) => part,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn message(&self) -> ContextMessage {
        ContextMessage {
            context: self.context(),
        }
    }

    fn summary(&self) -> SyncContext {
        match self.ok(SyncRequest::GetSummary(self.message())) {
            SyncResponse::Summary(s) => s.context,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn end(&self, remote_timestamp: Option<u64>) {
        let response = self.ok(SyncRequest::EndSession(EndSessionRequest {
            context: self.context(),
            client_applied: Default::default(),
            remote_timestamp,
            duration_ms: 3,
        }));
        assert!(matches!(response, SyncResponse::Ack(_)));
    }
}

#[test]
fn full_exchange() {
    let server = server();
    let replica = server.replica();
    replica.upsert("items", item(100, "server-a")).unwrap();
    replica.upsert("items", item(101, "server-b")).unwrap();

    let client = Client::new(&server);
    let scope = client.open(None);
    assert_eq!(scope.server_scope_id, replica.id());
    assert!(!scope.is_outdated);

    match client.ok(SyncRequest::EnsureSchema(client.message())) {
        SyncResponse::EnsureSchema(r) => assert_eq!(r.scope.schema.tables.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    match client.ok(SyncRequest::GetOperation(client.message())) {
        SyncResponse::Operation(r) => assert_eq!(r.operation, ServerOperation::Normal),
        other => panic!("unexpected {other:?}"),
    }

    let rows = vec![sync_row(1, "a"), sync_row(2, "b")];
    let first = client.send_part(client.upload(0, false, rows, None));
    assert!(first.server_batch.is_none());
    let last = client.send_part(client.upload(1, true, vec![sync_row(3, "c")], None));
    let batch = last.server_batch.unwrap();
    assert_eq!(batch.applied.total_applied(), 3);
    assert_eq!(batch.batch_count, 1);
    assert_eq!(batch.row_count, 2);

    let part = client.get_more(0);
    assert!(part.is_last_batch);
    assert_eq!(part.remote_timestamp, batch.remote_timestamp);
    let ids: Vec<_> = part.rows.iter().map(|r| r.values[0].clone()).collect();
    assert_eq!(ids, vec![Value::Integer(100), Value::Integer(101)]);

    assert!(matches!(
        client.ok(SyncRequest::SendEndDownloadChanges(client.message())),
        SyncResponse::Ack(_)
    ));
    client.end(Some(batch.remote_timestamp));
    assert_eq!(server.session_count(), 0);

    let history = replica.scopes().history("default", client.client_id).unwrap();
    assert_eq!(history.last_sync_timestamp, batch.remote_timestamp);
    assert_eq!(history.last_sync_duration_ms, 3);

    let tracking = replica
        .tracking_row("items", &PrimaryKey::from(1))
        .unwrap()
        .unwrap();
    assert_eq!(tracking.update_scope_id, Some(client.client_id));
    assert!(tracking.timestamp > batch.remote_timestamp);

    assert_eq!(
        client.error_code(SyncRequest::GetSummary(client.message())),
        ErrorCode::SessionLost
    );
}

#[test]
fn json_serializer_works_end_to_end() {
    let server = server();
    let mut client = Client::new(&server);
    client.serializer = Serializer::Json;
    client.open(None);
    let response = client.send_part(client.upload(0, true, vec![sync_row(5, "e")], None));
    assert_eq!(response.server_batch.unwrap().applied.total_applied(), 1);
}

#[test]
fn resume_after_crash_mid_batch() {
    let replica = replica();
    let store: Arc<dyn SessionStore> =
        Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
    let first = SyncServer::with_session_store(
        ServerConfig::default(),
        Arc::clone(&replica),
        Arc::clone(&store),
    );
    first
        .register_scope("default", &SyncSetup::new(["items"]))
        .unwrap();

    let client = Client::new(&first);
    client.open(None);
    let part0 = client.upload(0, false, vec![sync_row(1, "a"), sync_row(2, "b")], None);
    client.send_part(part0.clone());
    client.send_part(part0.clone());
    assert_eq!(client.summary().counters.rows_uploaded, 2);

    // A fresh server over the same replica and session store.
    let (session, client_id) = (client.session, client.client_id);
    drop(client);
    drop(first);
    let second =
        SyncServer::with_session_store(ServerConfig::default(), Arc::clone(&replica), store);
    let client = Client {
        server: &second,
        session,
        client_id,
        serializer: Serializer::Cbor,
    };

    let part1 = client.upload(1, true, vec![sync_row(3, "c")], None);
    let response = client.send_part(part1.clone());
    let key = PrimaryKey::from(3);
    let applied_at = replica.tracking_row("items", &key).unwrap().unwrap().timestamp;

    let replayed = client.send_part(part1);
    assert_eq!(replayed, response);
    assert_eq!(
        replica.tracking_row("items", &key).unwrap().unwrap().timestamp,
        applied_at
    );
    assert_eq!(client.summary().counters.rows_applied_on_server, 3);

    assert_eq!(client.error_code(part0), ErrorCode::StepOutOfSequence);
}

#[test]
fn failed_selection_keeps_the_upload_for_a_retransmit() {
    let backend = Arc::new(InMemoryBackend::new());
    let shared: Arc<dyn StorageBackend> = backend.clone();
    let config = ReplicaConfig::new("staged").with_staged_batches(true);
    let replica = Arc::new(Replica::open(shared, config).unwrap());
    replica
        .create_table(TableDescriptor::new(
            "items",
            vec![
                ColumnDescriptor::new("id", ColumnType::Integer),
                ColumnDescriptor::new("name", ColumnType::Text).nullable(),
            ],
            vec!["id".to_string()],
        ))
        .unwrap();
    let server = SyncServer::new(ServerConfig::default(), Arc::clone(&replica));
    let info = server
        .register_scope("default", &SyncSetup::new(["items"]))
        .unwrap();

    let client = Client::new(&server);
    client.open(None);
    client.send_part(client.upload(0, false, Vec::new(), None));

    replica.deprovision(&info.schema);
    let last = client.upload(1, true, Vec::new(), None);
    assert_eq!(client.error_code(last.clone()), ErrorCode::SchemaMissing);

    server
        .register_scope("default", &SyncSetup::new(["items"]))
        .unwrap();
    let response = client.send_part(last);
    assert!(response.server_batch.is_some());
    assert!(backend.keys("batch/").unwrap().is_empty());
}

#[test]
fn out_of_order_part_is_rejected_without_losing_the_session() {
    let server = server();
    let client = Client::new(&server);
    client.open(None);

    let code = client.error_code(client.upload(1, false, vec![sync_row(1, "a")], None));
    assert_eq!(code, ErrorCode::OutOfOrderBatchPart);

    client.send_part(client.upload(0, false, vec![sync_row(1, "a")], None));
    let done = client.send_part(client.upload(1, true, vec![sync_row(2, "b")], None));
    assert!(done.server_batch.is_some());

    let code = client.error_code(client.upload(2, true, vec![sync_row(3, "c")], None));
    assert_eq!(code, ErrorCode::StepOutOfSequence);
}

#[test]
fn steps_out_of_sequence_are_rejected() {
    let server = server();
    let client = Client::new(&server);
    assert_eq!(
        client.error_code(client.upload(0, true, Vec::new(), None)),
        ErrorCode::SessionLost
    );
    client.open(None);
    assert_eq!(
        client.error_code(SyncRequest::GetMoreChanges(GetChangesRequest {
            context: client.context(),
            batch_index: 0,
        })),
        ErrorCode::StepOutOfSequence
    );
    assert_eq!(
        client.error_code(SyncRequest::SendEndDownloadChanges(client.message())),
        ErrorCode::StepOutOfSequence
    );
}

#[test]
fn session_identity_is_checked() {
    let server = server();
    let client = Client::new(&server);
    client.open(None);

    let mut intruder = Client::new(&server);
    intruder.session = client.session;
    assert_eq!(
        intruder.error_code(SyncRequest::GetSummary(intruder.message())),
        ErrorCode::SessionMismatch
    );

    let mut context = client.context();
    context.scope_name = "other".to_string();
    assert_eq!(
        client.error_code(SyncRequest::GetSummary(ContextMessage { context })),
        ErrorCode::SessionMismatch
    );

    let mut context = client.context();
    context.session_id = SessionId::new();
    assert_eq!(
        client.error_code(SyncRequest::GetSummary(ContextMessage { context })),
        ErrorCode::SessionMismatch
    );
}

#[test]
fn checksum_mismatch_is_rejected() {
    let server = server();
    let client = Client::new(&server);
    let request = SyncRequest::EnsureScopes(EnsureScopesRequest {
        context: client.context(),
        last_server_sync_timestamp: None,
    });
    let body = request.encode(Serializer::Cbor).unwrap();
    let headers = RequestHeaders::new(client.session, "default", Serializer::Cbor, request.step())
        .with_hash(payload_hash(b"tampered"));
    let response = server.handle_request(&headers, &body);
    assert_eq!(response.status, 400);
    assert_eq!(server.session_count(), 0);
}

#[test]
fn server_wins_conflicts_unless_the_client_saw_the_row() {
    let server = server();
    let replica = server.replica();
    replica.upsert("items", item(7, "server")).unwrap();
    let seen = replica.current_timestamp();
    replica.upsert("items", item(8, "server")).unwrap();

    // The client has seen row 7 but not the write to row 8.
    let client = Client::new(&server);
    client.open(Some(seen));
    let response = client.send_part(client.upload(
        0,
        true,
        vec![sync_row(7, "client"), sync_row(8, "client")],
        Some(seen),
    ));
    let batch = response.server_batch.unwrap();
    let stats = &batch.applied.tables[0];
    assert_eq!(stats.table, "items");
    assert_eq!(stats.upserts, 1);
    assert_eq!(stats.conflicts, 1);

    assert_eq!(
        replica.get("items", &PrimaryKey::from(7)).unwrap().unwrap(),
        item(7, "client")
    );
    assert_eq!(
        replica.get("items", &PrimaryKey::from(8)).unwrap().unwrap(),
        item(8, "server")
    );

    // The server's version of row 8 comes back down; row 7 is an echo.
    let part = client.get_more(0);
    assert_eq!(part.rows.len(), 1);
    assert_eq!(part.rows[0].values, item(8, "server"));
}

#[test]
fn download_progress_estimate_and_timestamp() {
    let server = server_with(ServerConfig::default().with_max_rows_per_part(2));
    for id in 0..3 {
        server.replica().upsert("items", item(id, "s")).unwrap();
    }
    let client = Client::new(&server);
    client.open(None);

    match client.ok(SyncRequest::GetEstimatedChangesCount(EstimatedChangesRequest {
        context: client.context(),
        last_server_sync_timestamp: None,
    })) {
        SyncResponse::EstimatedChanges(r) => assert_eq!(r.count, 3),
        other => panic!("unexpected {other:?}"),
    }

    let response = client.send_part(client.upload(0, true, Vec::new(), None));
    let batch = response.server_batch.unwrap();
    assert_eq!(batch.batch_count, 2);

    let progress = |client: &Client<'_>| match client
        .ok(SyncRequest::GetChangesInProgress(client.message()))
    {
        SyncResponse::Progress(p) => p,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(progress(&client).next_index, 0);
    let first = client.get_more(0);
    assert!(!first.is_last_batch);
    client.get_more(0);
    let p = progress(&client);
    assert_eq!((p.batch_count, p.next_index), (2, 1));
    assert!(client.get_more(1).is_last_batch);
    assert_eq!(client.summary().counters.rows_downloaded, 3);

    match client.ok(SyncRequest::GetRemoteClientTimestamp(client.message())) {
        SyncResponse::RemoteTimestamp(r) => assert!(r.timestamp > batch.remote_timestamp),
        other => panic!("unexpected {other:?}"),
    }

    client.ok(SyncRequest::SendEndDownloadChanges(client.message()));
    assert_eq!(
        client.error_code(SyncRequest::GetMoreChanges(GetChangesRequest {
            context: client.context(),
            batch_index: 1,
        })),
        ErrorCode::StepOutOfSequence
    );
}

#[test]
fn operations_are_delivered_once() {
    let server = server();
    let client = Client::new(&server);
    server
        .set_operation("default", client.client_id, ServerOperation::Reinitialize)
        .unwrap();

    let operation = |client: &Client<'_>| match client
        .ok(SyncRequest::GetOperation(client.message()))
    {
        SyncResponse::Operation(r) => r.operation,
        other => panic!("unexpected {other:?}"),
    };
    client.open(None);
    assert_eq!(operation(&client), ServerOperation::Reinitialize);
    client.end(None);

    let mut again = Client::new(&server);
    again.client_id = client.client_id;
    again.open(None);
    assert_eq!(operation(&again), ServerOperation::Normal);
}

#[test]
fn metadata_cleanup_marks_lagging_clients_outdated() {
    let server = server();
    let replica = server.replica();
    let key = replica.upsert("items", item(1, "doomed")).unwrap();
    replica.delete("items", &key).unwrap();

    let client = Client::new(&server);
    client.open(None);
    let response = client.send_part(client.upload(0, true, Vec::new(), None));
    let remote = response.server_batch.unwrap().remote_timestamp;
    client.end(Some(remote));

    assert_eq!(server.delete_metadata("default").unwrap(), 1);
    assert!(replica.tracking_row("items", &key).unwrap().is_none());
    let info = replica.scopes().server("default").unwrap();
    assert_eq!(info.last_cleanup_timestamp, remote);
    assert_eq!(server.delete_metadata("default").unwrap(), 0);

    assert!(Client::new(&server).open(Some(0)).is_outdated);
    assert!(!Client::new(&server).open(Some(remote)).is_outdated);
    assert!(!Client::new(&server).open(None).is_outdated);
}

fn synced_client(replica: &Replica, scope: &str, last_sync_timestamp: u64) {
    replica.scopes().save_history(ServerHistoryScopeInfo {
        id: ScopeId::new(),
        name: scope.to_string(),
        last_sync_timestamp,
        last_sync: 1,
        last_sync_duration_ms: 1,
    });
}

fn last_cleanup(server: &SyncServer, scope: &str) -> u64 {
    server
        .replica()
        .scopes()
        .server(scope)
        .unwrap()
        .last_cleanup_timestamp
}

#[test]
fn metadata_cleanup_leaves_other_scopes_alone() {
    let server = server();
    let replica = server.replica();
    replica
        .create_table(TableDescriptor::new(
            "tags",
            vec![ColumnDescriptor::new("id", ColumnType::Integer)],
            vec!["id".to_string()],
        ))
        .unwrap();
    server
        .register_scope("labels", &SyncSetup::new(["tags"]))
        .unwrap();
    synced_client(replica, "labels", 0);

    let item_key = replica.upsert("items", item(1, "doomed")).unwrap();
    let tag_key = replica.upsert("tags", vec![Value::Integer(7)]).unwrap();
    replica.delete("items", &item_key).unwrap();
    replica.delete("tags", &tag_key).unwrap();
    let now = replica.current_timestamp();
    synced_client(replica, "default", now);

    assert_eq!(server.delete_metadata("default").unwrap(), 1);
    assert!(replica.tracking_row("items", &item_key).unwrap().is_none());
    assert!(replica.tracking_row("tags", &tag_key).unwrap().is_some());
    assert_eq!(last_cleanup(&server, "default"), now);
    assert_eq!(last_cleanup(&server, "labels"), 0);
}

#[test]
fn metadata_cleanup_waits_for_shared_tables() {
    let server = server();
    let replica = server.replica();
    server
        .register_scope("mirror", &SyncSetup::new(["items"]))
        .unwrap();

    let early = replica.upsert("items", item(1, "early")).unwrap();
    replica.delete("items", &early).unwrap();
    let lagging = replica.current_timestamp();
    synced_client(replica, "mirror", lagging);

    let late = replica.upsert("items", item(2, "late")).unwrap();
    replica.delete("items", &late).unwrap();
    synced_client(replica, "default", replica.current_timestamp());

    assert_eq!(server.delete_metadata("default").unwrap(), 1);
    assert!(replica.tracking_row("items", &early).unwrap().is_none());
    assert!(replica.tracking_row("items", &late).unwrap().is_some());
    assert_eq!(last_cleanup(&server, "default"), lagging);
    assert_eq!(last_cleanup(&server, "mirror"), lagging);
}

#[test]
fn snapshot_is_streamed_by_index() {
    let server = server_with(ServerConfig::default().with_max_rows_per_part(2));
    for id in 0..5 {
        server.replica().upsert("items", item(id, "s")).unwrap();
    }
    let client = Client::new(&server);
    client.open(None);

    let get = |index| match client.ok(SyncRequest::GetSnapshot(GetChangesRequest {
        context: client.context(),
        batch_index: index,
    })) {
        SyncResponse::Changes(part) => part,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(get(0).batch_count, 0);

    assert_eq!(server.create_snapshot("default").unwrap(), 3);
    let first = get(0);
    assert_eq!(first.batch_count, 3);
    assert_eq!(first.rows.len(), 2);
    assert!(first.remote_timestamp > 0);
    let last = get(2);
    assert!(last.is_last_batch);
    assert_eq!(last.rows.len(), 1);
    assert_eq!(
        client.error_code(SyncRequest::GetSnapshot(GetChangesRequest {
            context: client.context(),
            batch_index: 3,
        })),
        ErrorCode::InvalidPayload
    );
}

#[test]
fn replacing_a_snapshot_does_not_disturb_running_downloads() {
    let server = server_with(ServerConfig::default().with_max_rows_per_part(1));
    let replica = server.replica();
    for id in 1..=3 {
        replica.upsert("items", item(id, "s")).unwrap();
    }
    server.create_snapshot("default").unwrap();

    let client = Client::new(&server);
    client.open(None);
    let get = |index| match client.ok(SyncRequest::GetSnapshot(GetChangesRequest {
        context: client.context(),
        batch_index: index,
    })) {
        SyncResponse::Changes(part) => part,
        other => panic!("unexpected {other:?}"),
    };
    let first = get(0);

    replica.delete("items", &PrimaryKey::from(1)).unwrap();
    server.create_snapshot("default").unwrap();

    let mut parts = vec![first];
    parts.push(get(1));
    parts.push(get(2));
    let ids: Vec<Value> = parts.iter().map(|p| p.rows[0].values[0].clone()).collect();
    assert_eq!(ids, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    assert!(parts.iter().all(|p| p.remote_timestamp == parts[0].remote_timestamp));
    assert!(parts[2].is_last_batch);

    let late = Client::new(&server);
    late.open(None);
    match late.ok(SyncRequest::GetSnapshot(GetChangesRequest {
        context: late.context(),
        batch_index: 0,
    })) {
        SyncResponse::Changes(part) => {
            assert_eq!(part.batch_count, 2);
            assert!(part.remote_timestamp > parts[0].remote_timestamp);
        }
        other => panic!("unexpected {other:?}"),
    }
}
