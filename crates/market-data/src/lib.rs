pub mod hyperliquid;

pub use hyperliquid::{coin_for, interval_label, AssetContext, HyperliquidReader, DEFAULT_INFO_URL};

use exchange_trait::{MarketReader, MarketSnapshot};
use futures_util::future::join_all;

/// Market context for a set of symbols, fetched concurrently.
///
/// Best effort: a symbol that fails is logged and left out. The result keeps
/// the input order of the symbols that succeeded.
pub async fn fetch_context(
    reader: &dyn MarketReader,
    symbols: &[String],
    interval_minutes: u32,
) -> Vec<MarketSnapshot> {
    let results = join_all(symbols.iter().map(|s| reader.get(s, interval_minutes))).await;

    symbols
        .iter()
        .zip(results)
        .filter_map(|(symbol, result)| match result {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Skipping {} in market context: {:#}", symbol, e);
                None
            }
        })
        .collect()
}

/// Render snapshots as the text block handed to the proposal source.
pub fn render_context(reader: &dyn MarketReader, snapshots: &[MarketSnapshot]) -> String {
    snapshots
        .iter()
        .map(|s| reader.format(s))
        .collect::<Vec<_>>()
        .join("\n")
}
