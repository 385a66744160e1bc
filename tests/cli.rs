//! End-to-end tests for the `portfolio-qa` binary.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const HOLDINGS_CSV: &str = "\
AsOfDate,PortfolioName,SecurityName,Qty,MV_Base,PL_YTD,CloseDate
2024-12-31,Alpha,Apple Inc,100,19000.5,1200.25,
2024-12-31,Alpha,Microsoft,50,21000,-300,
2024-12-31,Beta,Apple Inc,10,1900.05,80,2024-11-30
";

const TRADES_CSV: &str = "\
TradeDate,PortfolioName,TradeTypeName,Quantity,Price,IsCustomAllocation
01/15/2024,Alpha,Buy,100,150.25,false
2024-02-20,Alpha,Sell,25,171.10,no
2024-03-05,Beta,Buy,10,190,yes
2024-03-06,Beta,Buy,5,191.5,1
";

struct Fixture {
    _dir: TempDir,
    db: PathBuf,
    holdings: PathBuf,
    trades: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let holdings = dir.path().join("holdings.csv");
        let trades = dir.path().join("trades.csv");
        std::fs::write(&holdings, HOLDINGS_CSV).unwrap();
        std::fs::write(&trades, TRADES_CSV).unwrap();
        Self {
            db: dir.path().join("state").join("portfolio.db"),
            _dir: dir,
            holdings,
            trades,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("portfolio-qa").unwrap();
        cmd.env_remove("PQA_DB_PATH")
            .env_remove("OPENAI_API_KEY")
            .env_remove("PQA_API_KEY")
            .env_remove("RUST_LOG")
            .arg("--db-path")
            .arg(&self.db);
        cmd
    }

    fn loaded() -> Self {
        let fx = Self::new();
        fx.cmd().arg("init").assert().success();
        fx.cmd()
            .args(["ingest", "--holdings"])
            .arg(&fx.holdings)
            .arg("--trades")
            .arg(&fx.trades)
            .assert()
            .success();
        fx
    }

    fn json(&self, args: &[&str]) -> Value {
        let out = self
            .cmd()
            .args(["--format", "json"])
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&out).unwrap()
    }
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[test]
fn init_creates_database_and_refuses_to_overwrite() {
    let fx = Fixture::new();
    fx.cmd()
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized portfolio-qa database"));
    assert!(fx.db.exists());

    fx.cmd()
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    fx.cmd().args(["init", "--force"]).assert().success();
}

#[test]
fn status_requires_init() {
    let fx = Fixture::new();
    fx.cmd()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn ingest_reports_counts() {
    let fx = Fixture::new();
    fx.cmd().arg("init").assert().success();
    fx.cmd()
        .args(["ingest", "--holdings", &path_str(&fx.holdings)])
        .args(["--trades", &path_str(&fx.trades)])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ingested 3 holdings and 4 trades"));

    let status = fx.json(&["status"]);
    assert_eq!(status["document_count"], 7);
    assert_eq!(status["collections"]["holdings"], 3);
    assert_eq!(status["collections"]["trades"], 4);
}

#[test]
fn ingest_replace_does_not_duplicate() {
    let fx = Fixture::loaded();
    fx.cmd()
        .args(["ingest", "--replace", "--trades", &path_str(&fx.trades)])
        .assert()
        .success();
    let status = fx.json(&["status"]);
    assert_eq!(status["collections"]["trades"], 4);
}

#[test]
fn ingest_without_paths_fails() {
    let fx = Fixture::new();
    fx.cmd().arg("init").assert().success();
    fx.cmd()
        .arg("ingest")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to ingest"));
}

#[test]
fn query_counts_buys() {
    let fx = Fixture::loaded();
    let payload = fx.json(&[
        "query",
        r#"{"collection":"trades","operation":"countDocuments","query":{"TradeTypeName":"Buy"}}"#,
    ]);
    assert_eq!(payload["success"], true);
    assert_eq!(payload["count"], 3);
    assert_eq!(payload["data"][0]["count"], 3);
    assert_eq!(payload["query_info"]["operation"], "countDocuments");
}

#[test]
fn query_active_positions_match_null_close_date() {
    let fx = Fixture::loaded();
    let payload = fx.json(&[
        "query",
        r#"{"collection":"holdings","operation":"find","query":{"CloseDate":null}}"#,
    ]);
    assert_eq!(payload["count"], 2);
}

#[test]
fn query_distinct_portfolios() {
    let fx = Fixture::loaded();
    let payload = fx.json(&[
        "query",
        r#"{"collection":"trades","operation":"distinct","field":"PortfolioName","query":{}}"#,
    ]);
    assert_eq!(payload["data"][0]["values"], serde_json::json!(["Alpha", "Beta"]));
    assert_eq!(payload["count"], 2);
}

#[test]
fn query_aggregate_groups_by_portfolio() {
    let fx = Fixture::loaded();
    let payload = fx.json(&[
        "query",
        r#"{"collection":"trades","operation":"aggregate","query":[
            {"$group":{"_id":"$PortfolioName","trades":{"$sum":1}}},
            {"$sort":{"_id":1}}
        ]}"#,
    ]);
    assert_eq!(payload["success"], true);
    assert_eq!(payload["data"][0]["_id"], "Alpha");
    assert_eq!(payload["data"][0]["trades"], 2);
    assert_eq!(payload["data"][1]["trades"], 2);
}

#[test]
fn query_rejects_blocked_operation() {
    let fx = Fixture::loaded();
    let payload = fx.json(&[
        "query",
        r#"{"collection":"trades","operation":"deleteMany","query":{}}"#,
    ]);
    assert_eq!(payload["success"], false);
    assert_eq!(payload["code"], "BlockedOperation");
    assert_eq!(payload["count"], 0);

    let status = fx.json(&["status"]);
    assert_eq!(status["collections"]["trades"], 4);
}

#[test]
fn validate_reports_reason_codes() {
    let fx = Fixture::new();
    fx.cmd()
        .args([
            "validate",
            r#"{"collection":"trades","operation":"find","query":{}}"#,
        ])
        .assert()
        .success()
        .stdout("ok\n");

    fx.cmd()
        .args([
            "validate",
            r#"{"collection":"trades","operation":"drop","query":{}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("BlockedOperation"));

    fx.cmd()
        .args([
            "validate",
            r#"{"collection":"trades","operation":"find","query":{"$where":"1"}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("DangerousPattern"));

    fx.cmd()
        .args(["validate", "not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid input"));
}

#[test]
fn sessions_start_empty() {
    let fx = Fixture::loaded();
    fx.cmd()
        .args(["session", "list"])
        .assert()
        .success()
        .stdout("No sessions.\n");
    fx.cmd()
        .args(["session", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn ask_without_api_key_fails() {
    let fx = Fixture::loaded();
    fx.cmd()
        .args(["ask", "How many trades?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key missing"));
}
