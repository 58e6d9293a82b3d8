//! Paper venue wrapper for tests that need the venue to misbehave.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use exchange_trait::{AccountBalance, ExchangeTrader, OpenOrder, OrderRef, PositionSide, PositionSnapshot};
use paper_exchange::PaperExchange;

pub(crate) struct HookedVenue {
    inner: Arc<PaperExchange>,
    positions_down: AtomicBool,
    hide_fills: AtomicBool,
    order_calls: AtomicU32,
    /// (closed symbol, symbol to reprice, new price)
    after_close: Mutex<Option<(String, String, f64)>>,
}

impl HookedVenue {
    pub(crate) fn new(inner: Arc<PaperExchange>) -> Self {
        Self {
            inner,
            positions_down: AtomicBool::new(false),
            hide_fills: AtomicBool::new(false),
            order_calls: AtomicU32::new(0),
            after_close: Mutex::new(None),
        }
    }

    pub(crate) fn fail_position_reads(&self) {
        self.positions_down.store(true, Ordering::SeqCst);
    }

    /// Report every fill with a zero quantity.
    pub(crate) fn hide_fill_quantities(&self) {
        self.hide_fills.store(true, Ordering::SeqCst);
    }

    /// Once a close on `closed` goes through, move `symbol` to `price`.
    pub(crate) fn reprice_after_close(&self, closed: &str, symbol: &str, price: f64) {
        *self.after_close.lock().unwrap() = Some((closed.to_string(), symbol.to_string(), price));
    }

    /// Calls that would place, cancel or fill an order.
    pub(crate) fn order_calls(&self) -> u32 {
        self.order_calls.load(Ordering::SeqCst)
    }

    fn order_call(&self) {
        self.order_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn after_fill(&self, mut fill: OrderRef) -> OrderRef {
        if self.hide_fills.load(Ordering::SeqCst) {
            fill.filled_quantity = 0.0;
        }
        fill
    }

    fn after_close(&self, symbol: &str) {
        let hook = self.after_close.lock().unwrap().clone();
        if let Some((closed, moved, price)) = hook {
            if closed == symbol {
                self.inner.set_price(&moved, price);
            }
        }
    }
}

#[async_trait]
impl ExchangeTrader for HookedVenue {
    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        if self.positions_down.load(Ordering::SeqCst) {
            bail!("position endpoint unavailable");
        }
        self.inner.get_positions().await
    }

    async fn get_balance(&self) -> Result<AccountBalance> {
        self.inner.get_balance().await
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64> {
        self.inner.get_market_price(symbol).await
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef> {
        self.order_call();
        let fill = self.inner.open_long(symbol, quantity, leverage).await?;
        Ok(self.after_fill(fill))
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef> {
        self.order_call();
        let fill = self.inner.open_short(symbol, quantity, leverage).await?;
        Ok(self.after_fill(fill))
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderRef> {
        self.order_call();
        let fill = self.inner.close_long(symbol, quantity).await?;
        self.after_close(symbol);
        Ok(self.after_fill(fill))
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderRef> {
        self.order_call();
        let fill = self.inner.close_short(symbol, quantity).await?;
        self.after_close(symbol);
        Ok(self.after_fill(fill))
    }

    async fn set_stop_loss(&self, symbol: &str, side: PositionSide, quantity: f64, price: f64) -> Result<()> {
        self.order_call();
        self.inner.set_stop_loss(symbol, side, quantity, price).await
    }

    async fn set_take_profit(&self, symbol: &str, side: PositionSide, quantity: f64, price: f64) -> Result<()> {
        self.order_call();
        self.inner.set_take_profit(symbol, side, quantity, price).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.order_call();
        self.inner.cancel_all_orders(symbol).await
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        self.inner.get_open_orders(symbol).await
    }

    fn quantity_precision(&self, symbol: &str) -> u32 {
        self.inner.quantity_precision(symbol)
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn venue_name(&self) -> &str {
        "hooked-paper"
    }
}
