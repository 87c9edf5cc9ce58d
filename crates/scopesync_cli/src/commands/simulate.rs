//! Simulate command implementation.

use scopesync_core::{
    ColumnDescriptor, ColumnType, PrimaryKey, Replica, ReplicaConfig, Row, SyncSchema, SyncSetup,
    TableDescriptor, Value,
};
use scopesync_sync_engine::{
    HttpResponse, HttpTransport, LoopbackClient, LoopbackServer, SyncAgent, SyncConfig,
    SyncSummary,
};
use scopesync_sync_protocol::Serializer;
use scopesync_sync_server::{ServerConfig, SyncServer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const TABLE: &str = "products";
const SCOPE: &str = "simulation";
const CLIENT_KEY_BASE: i64 = 1_000_000;

/// Parameters of a simulation.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Rows seeded on the server.
    pub rows: usize,
    /// Maximum rows per batch part on both sides.
    pub rows_per_part: usize,
    /// Rows edited on both sides between the two synchronizations.
    pub conflicts: usize,
    /// Whether the server prepares a snapshot for the new client.
    pub snapshot: bool,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Rows seeded on the server.
    pub seeded_rows: usize,
    /// Rows created on the client before its first synchronization.
    pub client_rows: usize,
    /// Rows edited on both sides.
    pub conflicting_rows: usize,
    /// One entry per synchronization.
    pub runs: Vec<RunReport>,
    /// Rows on the server at the end.
    pub server_total: usize,
    /// Rows on the client at the end.
    pub client_total: usize,
    /// Whether both replicas hold the same rows.
    pub converged: bool,
}

/// Counters of one synchronization.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Label of the run.
    pub label: String,
    /// Kind of synchronization performed.
    pub sync_type: String,
    /// Rows applied from a server snapshot.
    pub snapshot_rows: u64,
    /// Rows sent to the server.
    pub rows_uploaded: u64,
    /// Rows the server applied.
    pub upload_applied: u64,
    /// Conflicts raised on the server.
    pub upload_conflicts: u64,
    /// Rows received from the server.
    pub rows_downloaded: u64,
    /// Rows the client applied.
    pub download_applied: u64,
    /// Conflicts raised on the client.
    pub download_conflicts: u64,
    /// Server timestamp the client is now synchronized up to.
    pub remote_timestamp: Option<u64>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    fn new(label: &str, summary: &SyncSummary) -> Self {
        Self {
            label: label.to_string(),
            sync_type: format!("{:?}", summary.sync_type),
            snapshot_rows: summary.snapshot_rows,
            rows_uploaded: summary.rows_uploaded,
            upload_applied: summary.upload_applied.total_applied(),
            upload_conflicts: summary.upload_applied.total_conflicts(),
            rows_downloaded: summary.rows_downloaded,
            download_applied: summary.download_applied.total_applied(),
            download_conflicts: summary.download_applied.total_conflicts(),
            remote_timestamp: summary.remote_timestamp,
            duration_ms: u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

struct Loopback(Arc<SyncServer>);

impl LoopbackServer for Loopback {
    fn handle_post(&self, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
        let response = self.0.handle_raw(headers, body);
        HttpResponse {
            status: response.status,
            body: response.body,
            hash: Some(response.hash),
        }
    }
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Seeds a server, synchronizes a fresh client, edits rows on both sides
/// and synchronizes again.
pub fn simulate(options: &SimulateOptions) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    if options.rows_per_part == 0 {
        return Err("rows-per-part must be at least 1".into());
    }

    let server_replica = Arc::new(open_replica("server")?);
    for id in 0..options.rows {
        server_replica.upsert(TABLE, product(id as i64, "seeded"))?;
    }

    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_max_rows_per_part(options.rows_per_part),
        Arc::clone(&server_replica),
    ));
    server.register_scope(SCOPE, &SyncSetup::new([TABLE]))?;
    if options.snapshot {
        server.create_snapshot(SCOPE)?;
    }

    let client_replica = Arc::new(open_replica("client")?);
    let client_rows = (options.rows / 10).max(1);
    for offset in 0..client_rows {
        client_replica.upsert(TABLE, product(CLIENT_KEY_BASE + offset as i64, "client"))?;
    }

    let config = SyncConfig::new(SCOPE)
        .with_max_rows_per_part(options.rows_per_part)
        .with_snapshots(options.snapshot);
    let transport = HttpTransport::new(
        LoopbackClient::new(Loopback(Arc::clone(&server))),
        Serializer::Cbor,
    );
    let agent = SyncAgent::new(Arc::clone(&client_replica), config, transport);

    let mut runs = vec![RunReport::new("initial", &agent.synchronize()?)];

    let conflicting_rows = options.conflicts.min(options.rows);
    for id in 0..conflicting_rows {
        server_replica.upsert(TABLE, product(id as i64, "edited on server"))?;
        client_replica.upsert(TABLE, product(id as i64, "edited on client"))?;
    }
    runs.push(RunReport::new("after edits", &agent.synchronize()?));

    let server_rows = rows_by_key(&server_replica)?;
    let client_rows_now = rows_by_key(&client_replica)?;
    tracing::info!(
        server = server_rows.len(),
        client = client_rows_now.len(),
        "simulation finished"
    );

    Ok(SimulationReport {
        seeded_rows: options.rows,
        client_rows,
        conflicting_rows,
        runs,
        server_total: server_rows.len(),
        client_total: client_rows_now.len(),
        converged: server_rows == client_rows_now,
    })
}

fn products() -> TableDescriptor {
    TableDescriptor::new(
        TABLE,
        vec![
            ColumnDescriptor::new("id", ColumnType::Integer),
            ColumnDescriptor::new("name", ColumnType::Text),
            ColumnDescriptor::new("price", ColumnType::Real).nullable(),
        ],
        vec!["id".to_string()],
    )
}

fn product(id: i64, label: &str) -> Row {
    vec![
        Value::Integer(id),
        Value::Text(format!("{label} #{id}")),
        Value::Real(id as f64 * 0.25),
    ]
}

fn open_replica(name: &str) -> Result<Replica, Box<dyn std::error::Error>> {
    let replica = Replica::in_memory(ReplicaConfig::new(name))?;
    replica.create_table(products())?;
    Ok(replica)
}

fn rows_by_key(replica: &Replica) -> Result<BTreeMap<PrimaryKey, Row>, Box<dyn std::error::Error>> {
    let descriptor = products();
    let schema = SyncSchema::new(vec![descriptor.clone()]);
    let mut rows = BTreeMap::new();
    for change in replica.select_all_rows(&schema)? {
        let values = change?.row.values;
        rows.insert(descriptor.key_of(&values)?, values);
    }
    Ok(rows)
}

fn print_text_output(report: &SimulationReport) {
    println!("scopesync Simulation");
    println!("====================");
    println!();
    println!("Seeded server rows:  {}", report.seeded_rows);
    println!("Client-only rows:    {}", report.client_rows);
    println!("Conflicting rows:    {}", report.conflicting_rows);

    for run in &report.runs {
        println!();
        println!("Run '{}' ({}, {} ms):", run.label, run.sync_type, run.duration_ms);
        if run.snapshot_rows > 0 {
            println!("  Snapshot rows:    {}", run.snapshot_rows);
        }
        println!(
            "  Uploaded:   {} rows, {} applied, {} conflicts",
            run.rows_uploaded, run.upload_applied, run.upload_conflicts
        );
        println!(
            "  Downloaded: {} rows, {} applied, {} conflicts",
            run.rows_downloaded, run.download_applied, run.download_conflicts
        );
    }

    println!();
    println!("Server rows: {}", report.server_total);
    println!("Client rows: {}", report.client_total);
    println!(
        "Replicas {}",
        if report.converged { "converged" } else { "DIVERGED" }
    );
}
