//! Prompt rendering and reply parsing

use exchange_gateway::{Candle, TimeFrame};
use rust_decimal::prelude::*;
use serde_json::Value;

use super::LlmError;
use crate::indicators::IndicatorSnapshot;
use crate::signal::SignalAction;

/// Candles rendered into the prompt
pub const PROMPT_CANDLES: usize = 30;

pub const SYSTEM_PROMPT: &str = "You are a disciplined crypto futures analyst. \
Answer with a single JSON object and nothing else: \
{\"action\": \"BUY\" | \"SELL\" | \"HOLD\", \"confidence\": number between 0 and 1, \
\"reasoning\": short string, \"stop_loss\": number or null, \"take_profit\": number or null}. \
Prefer HOLD when the evidence is mixed.";

/// Parsed model answer
#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub action: SignalAction,
    pub confidence: f64,
    pub reasoning: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// System prompt with the bot's own preamble in front
pub fn system_prompt(preamble: Option<&str>) -> String {
    match preamble.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}\n\n{}", p, SYSTEM_PROMPT),
        None => SYSTEM_PROMPT.to_string(),
    }
}

pub fn build_prompt(
    symbol: &str,
    timeframe: TimeFrame,
    candles: &[Candle],
    indicators: &IndicatorSnapshot,
) -> String {
    let start = candles.len().saturating_sub(PROMPT_CANDLES);
    let mut rows = String::from("open_time,open,high,low,close,volume\n");
    for c in &candles[start..] {
        rows.push_str(&format!(
            "{},{},{},{},{},{}\n",
            c.open_time.format("%Y-%m-%dT%H:%MZ"),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        ));
    }
    let indicators = serde_json::to_string_pretty(indicators).unwrap_or_else(|_| "{}".into());

    format!(
        "Symbol: {symbol}\nTimeframe: {tf}\n\nLast {n} candles (oldest first):\n{rows}\nIndicators:\n{indicators}\n\n\
         Decide whether to open a LONG (BUY), a SHORT (SELL) or stay flat (HOLD) now.",
        symbol = symbol,
        tf = timeframe.as_str(),
        n = candles.len() - start,
        rows = rows,
        indicators = indicators,
    )
}

/// Extract the outermost JSON object, ignoring fences and chatter around it
fn json_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_action(value: &Value) -> Result<SignalAction, LlmError> {
    let text = value
        .as_str()
        .ok_or_else(|| LlmError::Parse("missing action".to_string()))?;
    match text.trim().to_ascii_uppercase().as_str() {
        "BUY" | "LONG" => Ok(SignalAction::Buy),
        "SELL" | "SHORT" => Ok(SignalAction::Sell),
        "HOLD" | "NEUTRAL" | "WAIT" => Ok(SignalAction::Hold),
        other => Err(LlmError::Parse(format!("unknown action '{}'", other))),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

/// Accepts 0..1 and 0..100 scales, clamped to [0, 1]
fn parse_confidence(value: &Value) -> Result<f64, LlmError> {
    let raw = number(value)
        .filter(|v| v.is_finite())
        .ok_or_else(|| LlmError::Parse("missing confidence".to_string()))?;
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    Ok(scaled.clamp(0.0, 1.0))
}

fn price(value: &Value) -> Option<Decimal> {
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        other => number(other).and_then(Decimal::from_f64),
    }?;
    (parsed > Decimal::ZERO).then_some(parsed)
}

pub fn parse_reply(raw: &str) -> Result<LlmReply, LlmError> {
    let body = json_slice(raw).ok_or_else(|| LlmError::Parse("no JSON object".to_string()))?;
    let value: Value =
        serde_json::from_str(body).map_err(|e| LlmError::Parse(e.to_string()))?;

    Ok(LlmReply {
        action: parse_action(&value["action"])?,
        confidence: parse_confidence(&value["confidence"])?,
        reasoning: value["reasoning"].as_str().unwrap_or_default().trim().to_string(),
        stop_loss: price(&value["stop_loss"]),
        take_profit: price(&value["take_profit"]),
    })
}
