use anyhow::Result;
use common::db::Database;
use common::store;
use common::types::{Priority, RiskLevel};

use crate::oracle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Wallets,
    Wallet { address: String },
    Track { address: String, priority: Priority },
    Alerts { address: Option<String> },
    Clusters,
    Oracle { address: String },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "wallets" => Ok(Command::Wallets),
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: engine wallet <address>".to_string())?;
            Ok(Command::Wallet { address })
        }
        "track" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: engine track <address> [priority]".to_string())?;
            let priority = args.next().map_or(Priority::Normal, |p| Priority::parse(&p));
            Ok(Command::Track { address, priority })
        }
        "alerts" => Ok(Command::Alerts {
            address: args.next(),
        }),
        "clusters" => Ok(Command::Clusters),
        "oracle" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: engine oracle <address>".to_string())?;
            Ok(Command::Oracle { address })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub fn run_command(db: &Database, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Wallets => show_wallets(db),
        Command::Wallet { address } => show_wallet(db, &address),
        Command::Track { address, priority } => track(db, &address, priority),
        Command::Alerts { address } => show_alerts(db, address.as_deref()),
        Command::Clusters => show_clusters(db),
        Command::Oracle { address } => show_oracle(db, &address),
    }
}

fn show_wallets(db: &Database) -> Result<()> {
    println!("Tracked wallets:");
    for row in store::tracked_wallets(&db.conn, 200)? {
        let analyzed = row
            .last_analyzed_at
            .map_or("never".to_string(), |ts| ts.to_string());
        println!(
            "{:>9}  last_analyzed={analyzed}  {}",
            row.priority.as_str(),
            row.wallet
        );
    }
    Ok(())
}

fn show_wallet(db: &Database, address: &str) -> Result<()> {
    let Some(score) = store::latest_trust_score(&db.conn, address)? else {
        println!("no score recorded for {address}");
        return Ok(());
    };
    println!("wallet:      {address}");
    println!("trust_score: {:.2}", score.score);
    println!(
        "risk_level:  {}",
        RiskLevel::from_score(score.score).as_str()
    );
    println!("computed_at: {}", score.computed_at);

    if let Some(profile) = store::wallet_profile(&db.conn, address)? {
        println!(
            "seen:        {} .. {}",
            profile.first_seen_at, profile.last_seen_at
        );
    }
    if let Some(state) = store::escalation_state(&db.conn, address)? {
        println!(
            "escalation:  {} ({:.1})",
            state.risk_stage.as_str(),
            state.escalation_score
        );
    }
    if let Some(rep) = store::reputation_state(&db.conn, address)? {
        println!(
            "trend:       {} avg_7d={:?} avg_30d={:?} volatility={:?}",
            rep.trend.as_str(),
            rep.avg_7d,
            rep.avg_30d,
            rep.volatility
        );
    }
    Ok(())
}

fn track(db: &Database, address: &str, priority: Priority) -> Result<()> {
    let inserted = store::track_wallet(&db.conn, address, priority)?;
    if inserted {
        println!("tracking {address} at priority {}", priority.as_str());
    } else {
        store::set_wallet_priority(&db.conn, address, priority)?;
        println!("already tracked; priority set to {}", priority.as_str());
    }
    Ok(())
}

fn show_alerts(db: &Database, address: Option<&str>) -> Result<()> {
    match address {
        Some(wallet) => {
            for a in store::alerts_for_wallet(&db.conn, wallet, None, None, 50)? {
                println!("{}  {:>10}  {}", a.created_at, a.severity, a.reason);
            }
        }
        None => {
            // No per-wallet filter: show the most recent alerts overall.
            let mut stmt = db.conn.prepare(
                "SELECT wallet, severity, reason, created_at
                 FROM alerts ORDER BY created_at DESC LIMIT 50",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows.filter_map(std::result::Result::ok) {
                let (wallet, severity, reason, created_at) = row;
                println!("{created_at}  {severity:>10}  {wallet}  {reason}");
            }
        }
    }
    Ok(())
}

fn show_clusters(db: &Database) -> Result<()> {
    for cluster in store::clusters_all(&db.conn, 100)? {
        let members = store::cluster_members(&db.conn, cluster.id)?;
        println!(
            "cluster {}  confidence={:.2}  risk={:?}  members={}  tags={}",
            cluster.id,
            cluster.confidence_score,
            cluster.cluster_risk,
            members.len(),
            cluster.reason_tags_json
        );
    }
    Ok(())
}

fn show_oracle(db: &Database, address: &str) -> Result<()> {
    match oracle::wallet_trust_lookup(&db.conn, address)? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("no trust data for {address}"),
    }
    Ok(())
}
