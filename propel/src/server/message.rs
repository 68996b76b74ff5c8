use crate::engine::{
    account::AccountSummary,
    executor::{CloseRejection, OrderRejection},
    price::PriceTick,
};
use propel_execution::{
    ClientOrderId, OrderId, PositionId,
    order::OrderRequest,
    position::Position,
    trade::Trade,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Inbound client-channel message envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Subscribe {
        symbols: Vec<SmolStr>,
    },
    Unsubscribe {
        symbols: Vec<SmolStr>,
    },
    PlaceOrder {
        #[serde(flatten)]
        request: OrderRequest,
    },
    ClosePosition {
        position_id: PositionId,
        #[serde(default)]
        quantity: Option<Decimal>,
    },
    ModifyTpsl {
        position_id: PositionId,
        #[serde(default)]
        take_profit: Option<Decimal>,
        #[serde(default)]
        stop_loss: Option<Decimal>,
    },
    CancelOrder {
        order_id: OrderId,
    },
}

/// Outbound client-channel message envelope.
///
/// Responses correlate by `client_order_id` or `position_id`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    PriceTick {
        tick: PriceTick,
    },
    DepthSnapshot {
        depth: propel_data::DepthUpdate,
    },
    Subscribed {
        symbols: Vec<SmolStr>,
    },
    Unsubscribed {
        symbols: Vec<SmolStr>,
    },
    OrderFilled {
        order_id: OrderId,
        client_order_id: Option<ClientOrderId>,
        position: Position,
    },
    OrderAccepted {
        order_id: OrderId,
        client_order_id: Option<ClientOrderId>,
    },
    OrderCancelled {
        order_id: OrderId,
    },
    OrderRejected {
        client_order_id: Option<ClientOrderId>,
        reason: OrderRejection,
    },
    CloseRejected {
        position_id: PositionId,
        reason: CloseRejection,
    },
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        trade: Trade,
        account: AccountSummary,
    },
    PositionPartiallyClosed {
        trade: Trade,
        remaining: Position,
        account: AccountSummary,
    },
    PositionUpdated {
        position: Position,
    },
    AccountUpdated {
        account: AccountSummary,
    },
    LiquidationWarning {
        position_id: PositionId,
        liquidation_price: Decimal,
        current_price: Decimal,
    },
    Error {
        message: String,
    },
}
