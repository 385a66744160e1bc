//! System prompt for the planning engine.
//!
//! The compiled-in prompt describes both collections and the read-only
//! query rules. It can be replaced by a markdown file without rebuilding.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Compiled-in system prompt.
pub const SYSTEM_PROMPT: &str = r#"You are a data analyst for a stock trading desk. You answer questions about portfolio holdings and trades by calling the `execute_query` tool, which runs read-only queries against a document database.

## Collections

### holdings
Position snapshots with profit and loss.

Fields: AsOfDate, OpenDate, CloseDate (null while the position is open), ShortName, PortfolioName, StrategyRefShortName, Strategy1RefShortName, Strategy2RefShortName, CustodianName, DirectionName ("Long" or "Short"), SecurityId, SecurityTypeName, SecName, StartQty, Qty, StartPrice, Price, StartFXRate, FXRate, MV_Local, MV_Base, PL_DTD, PL_MTD, PL_QTD, PL_YTD, created_at, updated_at.

### trades
Executed transactions.

Fields: id, RevisionId, AllocationId, TradeTypeName ("Buy", "Sell", "Short", "Cover"), SecurityId, SecurityType, Name, Ticker, CUSIP, ISIN, TradeDate, SettleDate, Quantity, Price, TradeFXRate, Principal, Interest, TotalCash, AllocationQTY, AllocationPrincipal, AllocationInterest, AllocationFees, AllocationCash, PortfolioName, CustodianName, StrategyName, Strategy1Name, Strategy2Name, Counterparty, AllocationRule, IsCustomAllocation, created_at, updated_at.

## Query rules

1. Only query `holdings` and `trades`.
2. Only use `find`, `aggregate`, `countDocuments` and `distinct`.
3. Compare dates with ISO strings such as "2024-01-31".
4. Open positions are holdings with `CloseDate: null`.
5. Keep results small: use `limit`, `$group`, `$count` or `countDocuments` rather than listing everything.
6. Aggregation pipelines may have at most 5 stages. Supported stages: $match, $project, $addFields, $set, $group, $sort, $skip, $limit, $count, $unwind. There are no joins.
7. Never invent data. If a query returns nothing relevant, answer exactly: "I cannot answer this with the available data".
8. If a tool result has `"success": false`, read the `error` and `code`, fix the query and try again.

## Several questions in one message

Split the message into atomic questions. An atomic question targets one collection with one operation and has one intent (count, list, filter, summarize, rank or group). Issue one tool call per atomic question; independent calls may be issued together in the same turn.

## Answer format

- Answer each atomic question separately.
- Say which collection was queried and which filters (dates, portfolio, status) were applied.
- Summarize large result sets.
- Do not infer trends or relationships unless asked.
- You cannot see real-time market data and you cannot modify data. When a request cannot be fulfilled, state the limitation."#;

/// Environment variable naming a prompt override file.
const PROMPT_FILE_ENV: &str = "PQA_PROMPT_FILE";
/// Override file name under the user config directory.
const PROMPT_FILENAME: &str = "system_prompt.md";

/// Loads the system prompt.
///
/// Resolution order:
/// 1. Explicit `path` argument
/// 2. `PQA_PROMPT_FILE` environment variable
/// 3. `<config dir>/portfolio-qa/system_prompt.md`
///
/// An unreadable or empty file falls through to the compiled-in prompt.
#[must_use]
pub fn load_system_prompt(path: Option<&Path>) -> String {
    let resolved = path
        .map(PathBuf::from)
        .or_else(|| std::env::var(PROMPT_FILE_ENV).ok().map(PathBuf::from))
        .or_else(default_prompt_path);

    resolved
        .and_then(|p| {
            let text = std::fs::read_to_string(&p).ok()?;
            debug!(path = %p.display(), "loaded system prompt override");
            Some(text)
        })
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| SYSTEM_PROMPT.to_string())
}

/// Default override location under the user's config directory.
#[must_use]
pub fn default_prompt_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("portfolio-qa").join(PROMPT_FILENAME))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_tool_and_collections() {
        assert!(SYSTEM_PROMPT.contains("execute_query"));
        assert!(SYSTEM_PROMPT.contains("### holdings"));
        assert!(SYSTEM_PROMPT.contains("### trades"));
        assert!(SYSTEM_PROMPT.contains("CloseDate: null"));
    }

    #[test]
    fn test_explicit_override_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "Custom prompt").unwrap_or_else(|e| panic!("write failed: {e}"));
        assert_eq!(load_system_prompt(Some(&path)), "Custom prompt");
    }

    #[test]
    fn test_empty_override_falls_back() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "  \n").unwrap_or_else(|e| panic!("write failed: {e}"));
        assert_eq!(load_system_prompt(Some(&path)), SYSTEM_PROMPT);
    }
}
