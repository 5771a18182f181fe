//! Deterministic end-to-end PIR session over an in-memory channel.
//!
//! The server runs on its own thread and follows the same script as the
//! client: query rounds, a pair of writes, and a long batch that runs past the
//! epoch budget and forces a refresh.

use clap::Parser;
use eyre::{bail, eyre, Result};
use hintpir::{Client, MemoryChannel, Params, Server};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::thread;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Run a deterministic in-memory hint PIR session")]
struct Args {
    /// Optional path to write the JSON summary.
    #[arg(long, env = "HINTPIR_OUTPUT")]
    output: Option<PathBuf>,

    /// Records in the scenario database.
    #[arg(long, env = "HINTPIR_NUM_ENTRIES", default_value_t = 1024)]
    num_entries: usize,

    /// Bytes per record.
    #[arg(long, env = "HINTPIR_ENTRY_SIZE", default_value_t = 16)]
    entry_size: usize,

    /// Primary hints per block offset.
    #[arg(long, env = "HINTPIR_KAPPA", default_value_t = hintpir::params::KAPPA)]
    kappa: usize,

    /// Lower the per-epoch query budget.
    #[arg(long, env = "HINTPIR_QUERY_BUDGET")]
    query_budget: Option<usize>,

    /// Client seed as 64 hex characters.
    #[arg(long, env = "HINTPIR_SEED")]
    seed: Option<String>,
}

#[derive(Serialize)]
struct RoundSummary {
    indices: Vec<usize>,
    result_sha256: Vec<String>,
}

#[derive(Serialize)]
struct ScenarioSummary {
    params: Params,
    rounds: Vec<RoundSummary>,
    updates: Vec<usize>,
    epochs: u64,
    refreshes: usize,
    queries_in_epoch: usize,
    cached_entries: usize,
    remaining_backup_hints: usize,
}

enum Step {
    Batch(Vec<usize>),
    Update(usize, Vec<u8>),
}

fn seed_from_label(label: &[u8]) -> [u8; 32] {
    Sha256::digest(label).into()
}

fn parse_seed(hex_seed: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_seed.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| eyre!("seed must be 32 bytes, got {}", b.len()))
}

fn deterministic_entry(index: usize, salt: &str, entry_size: usize) -> Vec<u8> {
    let mut entry = Vec::with_capacity(entry_size);
    let mut chunk = 0u32;
    while entry.len() < entry_size {
        let hash = Sha256::digest(format!("{salt}:{index}:{chunk}").as_bytes());
        let take = (entry_size - entry.len()).min(hash.len());
        entry.extend_from_slice(&hash[..take]);
        chunk += 1;
    }
    entry
}

fn sha256_hex(value: &[u8]) -> String {
    hex::encode(Sha256::digest(value))
}

/// Rounds, two writes, more rounds, then one batch long enough to exhaust
/// the budget. Indices stride by an odd step so no block runs dry.
fn script(params: &Params) -> Vec<Step> {
    let n = params.num_entries;
    let at = |k: usize| (k * 37) % n;
    let long: Vec<usize> = (0..params.query_budget + 16).map(|k| at(k + 100)).collect();
    vec![
        Step::Batch(vec![0, at(1), at(2), at(3)]),
        Step::Batch(vec![0, at(1)]),
        Step::Update(0, deterministic_entry(1000, "update-v1", params.entry_size)),
        Step::Update(at(5), deterministic_entry(1005, "update-v1", params.entry_size)),
        Step::Batch(vec![0, at(5), at(2)]),
        Step::Batch(long),
        Step::Batch(vec![0, at(5), at(7)]),
    ]
}

fn run_server(server: &mut Server, chan: &mut MemoryChannel, steps: &[Step]) -> Result<usize> {
    server.preprocess(chan)?;
    let mut refreshes = 0;
    for step in steps {
        match step {
            Step::Batch(indices) => {
                if server.respond_batch(chan, indices.len())? {
                    refreshes += 1;
                }
            }
            Step::Update(index, value) => {
                server.update(chan, *index, value)?;
            }
        }
    }
    Ok(refreshes)
}

fn run_client(
    client: &mut Client,
    chan: &mut MemoryChannel,
    steps: &[Step],
    expected_db: &mut [Vec<u8>],
) -> Result<(Vec<RoundSummary>, Vec<usize>)> {
    client.preprocess(chan)?;
    let mut rounds = Vec::new();
    let mut updates = Vec::new();
    for step in steps {
        match step {
            Step::Batch(indices) => {
                let values = client.query(chan, indices)?;
                let mut result_sha256 = Vec::with_capacity(values.len());
                for (&index, value) in indices.iter().zip(&values) {
                    if value != &expected_db[index] {
                        bail!("result mismatch at index={index}");
                    }
                    result_sha256.push(sha256_hex(value));
                }
                rounds.push(RoundSummary {
                    indices: indices.clone(),
                    result_sha256,
                });
            }
            Step::Update(index, value) => {
                let synced = client.sync_update(chan)?;
                if synced != *index {
                    bail!("expected update for index={index}, got {synced}");
                }
                expected_db[*index] = value.clone();
                updates.push(*index);
            }
        }
    }
    Ok((rounds, updates))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let params = Params::new(args.num_entries, args.entry_size, args.query_budget)?
        .with_kappa(args.kappa)?;
    let client_seed = match &args.seed {
        Some(hex_seed) => parse_seed(hex_seed)?,
        None => seed_from_label(b"hintpir_scenario_client_seed_v1"),
    };
    let filler_seed = seed_from_label(b"hintpir_scenario_filler_seed_v1");

    let mut expected_db: Vec<Vec<u8>> = (0..params.num_entries)
        .map(|i| deterministic_entry(i, "db-v1", params.entry_size))
        .collect();
    let mut server = Server::new(params.clone(), &expected_db.concat(), filler_seed)?;
    let mut client = Client::new(params.clone(), client_seed);
    let steps = script(&params);
    info!(
        num_entries = params.num_entries,
        num_blocks = params.num_blocks,
        budget = params.query_budget,
        "starting scenario"
    );

    // Each side owns its end so that an early exit hangs up on the peer.
    let (mut client_chan, mut server_chan) = MemoryChannel::pair();
    let steps = &steps;
    let (client_result, server_result) = thread::scope(|scope| {
        let server = &mut server;
        let server_thread = scope.spawn(move || run_server(server, &mut server_chan, steps));
        let client_result = run_client(&mut client, &mut client_chan, steps, &mut expected_db);
        drop(client_chan);
        let server_result = server_thread
            .join()
            .map_err(|_| eyre!("server thread panicked"))
            .and_then(|r| r);
        (client_result, server_result)
    });
    let (rounds, updates) = client_result?;
    let refreshes = server_result?;

    let summary = ScenarioSummary {
        params: params.clone(),
        rounds,
        updates,
        epochs: client.epoch(),
        refreshes,
        queries_in_epoch: client.queries_in_epoch(),
        cached_entries: client.num_cached_entries(),
        remaining_backup_hints: client.remaining_backup_hints(),
    };

    let output = serde_json::to_string_pretty(&summary)?;
    println!("{output}");
    if let Some(path) = args.output {
        std::fs::write(path, format!("{output}\n"))?;
    }

    Ok(())
}
