pub mod private_ws;
pub mod public_ws;
pub mod rest;
pub mod wire;

pub use private_ws::PrivateSession;
pub use public_ws::PublicWs;
pub use rest::{ApiCredentials, RemoteOrder, RestClient};
pub use wire::{
    bot_client_order_id, numeric_order_suffix, stoploss_client_order_id, OrderEvent,
    OrderEventStatus, PublicMessage, SummaryTick,
};
