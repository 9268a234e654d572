use serde::{Deserialize, Serialize};

/// Cached order snapshot written by the order pipeline.
///
/// Only the fields this core reads are modelled; anything else in the blob
/// is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
    #[serde(default)]
    pub order_no: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub channel_id: i64,

    #[serde(default)]
    pub return_url: String,
}

/// One payment app link offered for a UPI order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub wallet_name: String,

    pub wallet_code: String,

    pub pay_url: String,
}

/// `payin:upi:<id>:no` maps a public UPI id to the internal order number.
pub fn upi_order_no_key(upi_id: &str) -> String {
    format!("payin:upi:{upi_id}:no")
}

/// `payin:upi:<id>:url` holds the JSON list of wallet links.
pub fn upi_wallets_key(upi_id: &str) -> String {
    format!("payin:upi:{upi_id}:url")
}

/// `payin:order:<order_no>` holds the cached [`OrderState`].
pub fn order_state_key(order_no: &str) -> String {
    format!("payin:order:{order_no}")
}
