//! Output formatting for the cadence CLI
//!
//! Every formatter renders either a comfy-table (human) or pretty JSON.

use cadence_core::ledger::PriceTable;
use cadence_core::scorer::ReengagementCandidate;
use cadence_core::store::PendingReconciliation;
use cadence_types::{LedgerEntry, OutboundMessage, Unit, UsageSnapshot};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use serde::Serialize;

// ============================================================================
// Formatters
// ============================================================================

fn to_json<T: Serialize + ?Sized>(value: &T, empty: &str) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| empty.to_string())
}

fn table_with_header(columns: &[&str], no_color: bool) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    if no_color {
        table.set_header(columns.to_vec());
    } else {
        table.set_header(
            columns
                .iter()
                .map(|c| Cell::new(c).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
    table
}

/// Wallet balance and today's usage
pub fn format_balance(snapshot: &UsageSnapshot, json: bool, no_color: bool) -> String {
    if json {
        return to_json(snapshot, "{}");
    }

    let mut table = table_with_header(&["Feature", "Used today", "Free left", "Price"], no_color);
    for usage in &snapshot.features {
        table.add_row(Row::from(vec![
            usage.kind.as_str().to_string(),
            usage.used.to_string(),
            usage.free_left.to_string(),
            format_cents(usage.price_cents),
        ]));
    }

    format!(
        "Mode:    {}\nBalance: {}\n{}",
        snapshot.mode.as_str(),
        format_cents(snapshot.balance_cents),
        table
    )
}

/// Ledger entries, newest first
pub fn format_ledger(entries: &[LedgerEntry], json: bool, no_color: bool) -> String {
    if json {
        return to_json(entries, "[]");
    }
    if entries.is_empty() {
        return "No ledger entries.".to_string();
    }

    let mut table = table_with_header(&["Date", "Counterparty", "Mode", "Feature", "Units", "Amount"], no_color);
    for entry in entries {
        let feature = entry
            .feature
            .map(|f| f.id().to_string())
            .unwrap_or_else(|| "top-up".to_string());
        table.add_row(Row::from(vec![
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&entry.counterparty_id, 20),
            entry.mode.as_str().to_string(),
            feature,
            entry.units.to_string(),
            format_signed_cents(entry.amount_cents),
        ]));
    }
    table.to_string()
}

/// Effective price table
pub fn format_pricing(prices: &PriceTable, json: bool, no_color: bool) -> String {
    if json {
        let rules: std::collections::BTreeMap<String, _> =
            prices.iter().map(|(f, r)| (f.id().to_string(), *r)).collect();
        return to_json(&rules, "{}");
    }

    let mut table = table_with_header(&["Feature", "Unit", "Price", "Free / day", "Active"], no_color);
    for (feature, rule) in prices.iter() {
        let unit = match rule.unit {
            Unit::Message => "message",
            Unit::Second => "second",
        };
        table.add_row(Row::from(vec![
            feature.id().to_string(),
            unit.to_string(),
            format_cents(rule.price_cents),
            rule.free_allowance.to_string(),
            if rule.active { "yes" } else { "no" }.to_string(),
        ]));
    }
    table.to_string()
}

pub fn format_candidates(candidates: &[ReengagementCandidate], json: bool, no_color: bool) -> String {
    if json {
        return to_json(candidates, "[]");
    }
    if candidates.is_empty() {
        return "No relationships due for re-engagement.".to_string();
    }

    let mut table = table_with_header(&["User", "Counterparty", "Idle days", "Balance", "Score"], no_color);
    for c in candidates {
        table.add_row(Row::from(vec![
            c.key.subject_id.clone(),
            c.key.counterparty_id.clone(),
            format!("{:.1}", c.idle_days),
            format_cents(c.balance_cents),
            format!("{:.2}", c.score),
        ]));
    }
    table.to_string()
}

pub fn format_reconciliations(pending: &[PendingReconciliation], json: bool, no_color: bool) -> String {
    if json {
        return to_json(pending, "[]");
    }
    if pending.is_empty() {
        return "No charges awaiting reconciliation.".to_string();
    }

    let mut table = table_with_header(&["Date", "Conversation", "User", "Counterparty", "Feature", "Units", "Error"], no_color);
    for p in pending {
        table.add_row(Row::from(vec![
            p.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(p.conversation_id.as_str(), 16),
            p.wallet.user_id.clone(),
            p.wallet.counterparty_id.clone(),
            p.feature.id().to_string(),
            p.units.to_string(),
            truncate(&p.error, 40),
        ]));
    }
    table.to_string()
}

/// One turn result as shown in `cadence chat`
pub fn format_outbound(message: &OutboundMessage) -> String {
    match message {
        OutboundMessage::Reply {
            reply,
            usage,
            relationship,
            billing_pending,
        } => {
            let mut lines = vec![format!("< {}", reply)];
            let mut status = Vec::new();
            if let Some(usage) = usage {
                status.push(format!("balance {}", format_cents(usage.balance_cents)));
            }
            if let Some(rel) = relationship {
                status.push(format!("score {:.2}", rel.score));
                status.push(rel.stage.as_str().to_string());
                if rel.cooldown > 0 {
                    status.push(format!("cooldown {}", rel.cooldown));
                }
            }
            if *billing_pending {
                status.push("billing pending".to_string());
            }
            if !status.is_empty() {
                lines.push(format!("  [{}]", status.join(", ")));
            }
            lines.join("\n")
        }
        OutboundMessage::Error { error, code } => format!("! {} ({})", error, code),
    }
}

// ============================================================================
// Utilities
// ============================================================================

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

fn format_signed_cents(cents: i64) -> String {
    if cents > 0 {
        format!("+{}", format_cents(cents))
    } else {
        format_cents(cents)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        s.to_string()
    } else {
        s.chars().take(max - 1).collect::<String>() + "…"
    }
}

// ============================================================================
// Tests
// ============================================================================
