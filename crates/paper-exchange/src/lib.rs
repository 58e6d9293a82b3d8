//! Simulated perpetual futures venue.
//!
//! Fills market orders at the current price, keeps hedge-mode positions per
//! (symbol, side), charges a flat taker fee and realises PnL into the wallet
//! on close. Resting stop/take-profit orders trigger when the price crosses
//! them, evaluated every time positions are read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use exchange_trait::{
    leveraged_pnl_pct, truncate_quantity, AccountBalance, ExchangeTrader, MarketReader, OpenOrder,
    OrderKind, OrderRef, PositionKey, PositionSide, PositionSnapshot, DEFAULT_LEVERAGE,
};
use tokio::sync::Mutex;

const DEFAULT_FEE_RATE: f64 = 0.0004;

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: f64,
    entry_price: f64,
    leverage: u32,
    opened_at: DateTime<Utc>,
}

impl PaperPosition {
    fn pnl_at(&self, side: PositionSide, price: f64, quantity: f64) -> f64 {
        match side {
            PositionSide::Long => (price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - price) * quantity,
        }
    }

    fn margin(&self) -> f64 {
        self.quantity * self.entry_price / f64::from(self.leverage.max(1))
    }
}

#[derive(Debug, Default)]
struct PaperAccount {
    wallet_balance: f64,
    positions: HashMap<PositionKey, PaperPosition>,
    orders: Vec<OpenOrder>,
}

pub struct PaperExchange {
    name: String,
    account: Mutex<PaperAccount>,
    prices: DashMap<String, f64>,
    reader: Option<Arc<dyn MarketReader>>,
    fee_rate: f64,
    precision: u32,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    /// Prices must be supplied with [`PaperExchange::set_price`].
    pub fn new(starting_balance: f64) -> Self {
        Self {
            name: "paper".to_string(),
            account: Mutex::new(PaperAccount {
                wallet_balance: starting_balance,
                ..PaperAccount::default()
            }),
            prices: DashMap::new(),
            reader: None,
            fee_rate: DEFAULT_FEE_RATE,
            precision: 3,
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Prices come from a live market reader and are cached per symbol.
    pub fn with_market(starting_balance: f64, reader: Arc<dyn MarketReader>) -> Self {
        Self {
            reader: Some(reader),
            ..Self::new(starting_balance)
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, decimals: u32) -> Self {
        self.precision = decimals;
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }

    fn cached_price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).map(|p| *p)
    }

    fn next_id(&self) -> String {
        format!("PAPER-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        if let Some(reader) = &self.reader {
            match reader.get(symbol, 1).await {
                Ok(snapshot) if snapshot.current_price > 0.0 => {
                    self.set_price(symbol, snapshot.current_price);
                    return Ok(snapshot.current_price);
                }
                Ok(_) => tracing::warn!("Market reader returned no price for {}", symbol),
                Err(e) => tracing::warn!("Price fetch for {} failed: {:#}", symbol, e),
            }
        }
        self.cached_price(symbol)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| anyhow!("No market price for {}", symbol))
    }

    /// Fill any resting stop/take-profit whose trigger the cached price has crossed.
    /// Returns the fills.
    pub async fn settle_triggers(&self) -> Vec<OrderRef> {
        let mut account = self.account.lock().await;
        let mut fills = Vec::new();

        let triggered: Vec<OpenOrder> = account
            .orders
            .iter()
            .filter(|order| {
                let (Some(side), Some(price)) = (order.position_side, self.cached_price(&order.symbol))
                else {
                    return false;
                };
                match (order.kind, side) {
                    (OrderKind::StopMarket, PositionSide::Long) => price <= order.trigger_price,
                    (OrderKind::StopMarket, PositionSide::Short) => price >= order.trigger_price,
                    (OrderKind::TakeProfitMarket, PositionSide::Long) => price >= order.trigger_price,
                    (OrderKind::TakeProfitMarket, PositionSide::Short) => price <= order.trigger_price,
                    (OrderKind::Other, _) => false,
                }
            })
            .cloned()
            .collect();

        for order in triggered {
            account.orders.retain(|o| o.order_id != order.order_id);
            let Some(side) = order.position_side else {
                continue;
            };
            let key = PositionKey::new(order.symbol.clone(), side);
            if !account.positions.contains_key(&key) {
                continue;
            }
            tracing::info!(
                "Paper {:?} triggered for {} at {:.4}",
                order.kind,
                key,
                order.trigger_price
            );
            match self.reduce(&mut account, &key, order.quantity, order.trigger_price) {
                Ok(fill) => fills.push(fill),
                Err(e) => tracing::warn!("Paper trigger fill failed for {}: {:#}", key, e),
            }
        }

        fills
    }

    fn open(
        &self,
        account: &mut PaperAccount,
        key: PositionKey,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderRef> {
        let quantity = truncate_quantity(quantity, self.precision);
        if quantity <= 0.0 {
            bail!("Order quantity for {} rounds to zero", key.symbol);
        }
        let leverage = if leverage == 0 { DEFAULT_LEVERAGE } else { leverage };

        let notional = quantity * price;
        let fee = notional * self.fee_rate;
        let used: f64 = account.positions.values().map(PaperPosition::margin).sum();
        let available = account.wallet_balance - used;
        let required = notional / f64::from(leverage) + fee;
        if required > available {
            bail!(
                "Insufficient margin for {}: need {:.2}, available {:.2}",
                key,
                required,
                available
            );
        }

        account.wallet_balance -= fee;
        let position = account
            .positions
            .entry(key.clone())
            .or_insert_with(|| PaperPosition {
                quantity: 0.0,
                entry_price: price,
                leverage,
                opened_at: Utc::now(),
            });
        let total = position.quantity + quantity;
        position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
        position.quantity = total;
        position.leverage = leverage;

        tracing::info!(
            "Paper fill: open {} qty {} @ {:.4} ({}x), position now {}",
            key,
            quantity,
            price,
            leverage,
            total
        );

        Ok(OrderRef {
            order_id: self.next_id(),
            symbol: key.symbol,
            filled_quantity: quantity,
            average_price: Some(price),
        })
    }

    fn reduce(
        &self,
        account: &mut PaperAccount,
        key: &PositionKey,
        quantity: f64,
        price: f64,
    ) -> Result<OrderRef> {
        let position = account
            .positions
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("No open position for {}", key))?;

        let close_all = quantity <= 0.0 || quantity >= position.quantity;
        let closed = if close_all {
            position.quantity
        } else {
            truncate_quantity(quantity, self.precision)
        };
        if closed <= 0.0 {
            bail!("Close quantity for {} rounds to zero", key);
        }

        let realized = position.pnl_at(key.side, price, closed);
        let fee = closed * price * self.fee_rate;
        account.wallet_balance += realized - fee;

        if close_all {
            account.positions.remove(key);
            account
                .orders
                .retain(|o| !(o.symbol == key.symbol && o.position_side == Some(key.side)));
        } else if let Some(p) = account.positions.get_mut(key) {
            p.quantity -= closed;
        }

        tracing::info!(
            "Paper fill: close {} qty {} @ {:.4}, realized {:+.2}",
            key,
            closed,
            price,
            realized
        );

        Ok(OrderRef {
            order_id: self.next_id(),
            symbol: key.symbol.clone(),
            filled_quantity: closed,
            average_price: Some(price),
        })
    }

    async fn open_side(&self, symbol: &str, side: PositionSide, quantity: f64, leverage: u32) -> Result<OrderRef> {
        let price = self.current_price(symbol).await?;
        let mut account = self.account.lock().await;
        self.open(&mut account, PositionKey::new(symbol, side), quantity, leverage, price)
    }

    async fn close_side(&self, symbol: &str, side: PositionSide, quantity: f64) -> Result<OrderRef> {
        let price = self.current_price(symbol).await?;
        let mut account = self.account.lock().await;
        self.reduce(&mut account, &PositionKey::new(symbol, side), quantity, price)
    }

    async fn place_trigger(
        &self,
        symbol: &str,
        side: PositionSide,
        kind: OrderKind,
        quantity: f64,
        price: f64,
    ) -> Result<()> {
        if price <= 0.0 {
            bail!("Trigger price must be positive, got {}", price);
        }
        let mut account = self.account.lock().await;
        if !account.positions.contains_key(&PositionKey::new(symbol, side)) {
            bail!("No open {} position for {}", side, symbol);
        }
        let order = OpenOrder {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            position_side: Some(side),
            kind,
            trigger_price: price,
            quantity,
        };
        tracing::debug!("Paper {:?} placed for {} {} at {:.4}", kind, symbol, side, price);
        account.orders.push(order);
        Ok(())
    }
}

#[async_trait]
impl ExchangeTrader for PaperExchange {
    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        self.settle_triggers().await;
        let account = self.account.lock().await;

        let mut positions: Vec<PositionSnapshot> = account
            .positions
            .iter()
            .map(|(key, p)| {
                let mark = self.cached_price(&key.symbol).unwrap_or(p.entry_price);
                let lev = f64::from(p.leverage.max(1));
                let liquidation_price = match key.side {
                    PositionSide::Long => p.entry_price * (1.0 - 1.0 / lev),
                    PositionSide::Short => p.entry_price * (1.0 + 1.0 / lev),
                };
                PositionSnapshot {
                    symbol: key.symbol.clone(),
                    side: key.side,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    leverage: p.leverage,
                    unrealized_pnl: p.pnl_at(key.side, mark, p.quantity),
                    unrealized_pnl_pct: leveraged_pnl_pct(key.side, p.entry_price, mark, p.leverage),
                    liquidation_price,
                    update_time: Some(p.opened_at),
                }
            })
            .collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(positions)
    }

    async fn get_balance(&self) -> Result<AccountBalance> {
        let account = self.account.lock().await;
        let mut unrealized = 0.0;
        let mut margin = 0.0;
        for (key, p) in &account.positions {
            let mark = self.cached_price(&key.symbol).unwrap_or(p.entry_price);
            unrealized += p.pnl_at(key.side, mark, p.quantity);
            margin += p.margin();
        }
        Ok(AccountBalance {
            wallet_balance: account.wallet_balance,
            unrealized_pnl: unrealized,
            available_balance: (account.wallet_balance + unrealized - margin).max(0.0),
        })
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64> {
        self.current_price(symbol).await
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef> {
        self.open_side(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef> {
        self.open_side(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderRef> {
        self.close_side(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderRef> {
        self.close_side(symbol, PositionSide::Short, quantity).await
    }

    async fn set_stop_loss(&self, symbol: &str, side: PositionSide, quantity: f64, price: f64) -> Result<()> {
        self.place_trigger(symbol, side, OrderKind::StopMarket, quantity, price).await
    }

    async fn set_take_profit(&self, symbol: &str, side: PositionSide, quantity: f64, price: f64) -> Result<()> {
        self.place_trigger(symbol, side, OrderKind::TakeProfitMarket, quantity, price).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let mut account = self.account.lock().await;
        let before = account.orders.len();
        account.orders.retain(|o| o.symbol != symbol);
        tracing::debug!("Paper cancelled {} orders for {}", before - account.orders.len(), symbol);
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let account = self.account.lock().await;
        Ok(account
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    fn quantity_precision(&self, _symbol: &str) -> u32 {
        self.precision
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn venue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn exchange() -> PaperExchange {
        let ex = PaperExchange::new(10_000.0).with_fee_rate(0.0);
        ex.set_price("BTCUSDT", 50_000.0);
        ex
    }

    #[tokio::test]
    async fn test_open_and_mark_to_market() {
        let ex = exchange();
        let fill = ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        assert_relative_eq!(fill.filled_quantity, 0.1);
        assert_eq!(fill.average_price, Some(50_000.0));

        ex.set_price("BTCUSDT", 51_000.0);
        let positions = ex.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_relative_eq!(positions[0].unrealized_pnl, 100.0, epsilon = 1e-6);
        // 2% move at 5x
        assert_relative_eq!(positions[0].unrealized_pnl_pct, 10.0, epsilon = 1e-9);

        let balance = ex.get_balance().await.unwrap();
        assert_relative_eq!(balance.total_equity(), 10_100.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_hedge_mode_keeps_sides_apart() {
        let ex = exchange();
        ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        ex.open_short("BTCUSDT", 0.05, 5).await.unwrap();
        let positions = ex.get_positions().await.unwrap();
        assert_eq!(positions.len(), 2);
    }

    #[tokio::test]
    async fn test_increase_averages_entry() {
        let ex = exchange();
        ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        ex.set_price("BTCUSDT", 52_000.0);
        ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        let positions = ex.get_positions().await.unwrap();
        assert_relative_eq!(positions[0].quantity, 0.2, epsilon = 1e-12);
        assert_relative_eq!(positions[0].entry_price, 51_000.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_partial_then_full_close_realizes_pnl() {
        let ex = exchange();
        ex.open_short("BTCUSDT", 0.2, 5).await.unwrap();
        ex.set_price("BTCUSDT", 49_000.0);

        let fill = ex.close_short("BTCUSDT", 0.1).await.unwrap();
        assert_relative_eq!(fill.filled_quantity, 0.1);
        let fill = ex.close_short("BTCUSDT", 0.0).await.unwrap();
        assert_relative_eq!(fill.filled_quantity, 0.1, epsilon = 1e-12);

        assert!(ex.get_positions().await.unwrap().is_empty());
        let balance = ex.get_balance().await.unwrap();
        assert_relative_eq!(balance.wallet_balance, 10_200.0, epsilon = 1e-6);
        assert!(ex.close_short("BTCUSDT", 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let ex = exchange();
        // 2 BTC at 50k and 5x needs 20k margin
        assert!(ex.open_long("BTCUSDT", 2.0, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_triggers_on_read() {
        let ex = exchange();
        ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        ex.set_stop_loss("BTCUSDT", PositionSide::Long, 0.1, 49_000.0)
            .await
            .unwrap();
        ex.set_take_profit("BTCUSDT", PositionSide::Long, 0.1, 55_000.0)
            .await
            .unwrap();
        assert_eq!(ex.get_open_orders("BTCUSDT").await.unwrap().len(), 2);

        ex.set_price("BTCUSDT", 48_500.0);
        assert!(ex.get_positions().await.unwrap().is_empty());
        // Protective orders for the flat side are gone too
        assert!(ex.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        let balance = ex.get_balance().await.unwrap();
        assert_relative_eq!(balance.wallet_balance, 9_900.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_cancel_all_orders() {
        let ex = exchange();
        ex.open_long("BTCUSDT", 0.1, 5).await.unwrap();
        ex.set_stop_loss("BTCUSDT", PositionSide::Long, 0.1, 49_000.0)
            .await
            .unwrap();
        ex.cancel_all_orders("BTCUSDT").await.unwrap();
        assert!(ex.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        assert!(ex
            .set_stop_loss("BTCUSDT", PositionSide::Short, 0.1, 51_000.0)
            .await
            .is_err());
    }
}
