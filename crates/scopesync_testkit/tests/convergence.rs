//! Replicas converge after concurrent random writes and a full round of
//! synchronizations.

use proptest::prelude::*;
use scopesync_sync_engine::{
    HttpResponse, HttpTransport, LoopbackClient, LoopbackServer, SyncAgent, SyncConfig,
};
use scopesync_sync_protocol::Serializer;
use scopesync_sync_server::{ServerConfig, SyncServer};
use scopesync_testkit::prelude::*;
use std::sync::Arc;

struct Local(Arc<SyncServer>);

impl LoopbackServer for Local {
    fn handle_post(&self, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
        let response = self.0.handle_raw(headers, body);
        HttpResponse {
            status: response.status,
            body: response.body,
            hash: Some(response.hash),
        }
    }
}

type Agent = SyncAgent<HttpTransport<LoopbackClient<Local>>>;

fn agent(server: &Arc<SyncServer>, client: &TestReplica) -> Agent {
    let config = SyncConfig::new(SCOPE).with_max_rows_per_part(3);
    let transport = HttpTransport::new(
        LoopbackClient::new(Local(Arc::clone(server))),
        Serializer::Cbor,
    );
    SyncAgent::new(client.share(), config, transport)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_writers_converge(
        on_server in local_writes_strategy(6, 12),
        on_first in local_writes_strategy(6, 12),
        on_second in local_writes_strategy(6, 12),
    ) {
        let server_replica = TestReplica::memory("server");
        let server = Arc::new(SyncServer::new(
            ServerConfig::default().with_max_rows_per_part(4),
            server_replica.share(),
        ));
        server.register_scope(SCOPE, &setup()).unwrap();
        let first = TestReplica::memory("first");
        let second = TestReplica::memory("second");
        let first_agent = agent(&server, &first);
        let second_agent = agent(&server, &second);
        first_agent.synchronize().unwrap();
        second_agent.synchronize().unwrap();

        apply_writes(&server_replica, &on_server).unwrap();
        apply_writes(&first, &on_first).unwrap();
        apply_writes(&second, &on_second).unwrap();

        first_agent.synchronize().unwrap();
        second_agent.synchronize().unwrap();
        first_agent.synchronize().unwrap();

        assert_converged(&server_replica, &first, &[ITEMS, NOTES]);
        assert_converged(&server_replica, &second, &[ITEMS, NOTES]);
    }
}
