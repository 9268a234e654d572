use axum::Json;
use axum::extract::{Path, Query, State};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::WalletInfo;
use crate::infrastructure::{OrderCache, PayType, StatsRecord};
use crate::server::AppState;
use crate::server::responses::{ApiError, ResponseBody};

static PAYEE_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"pa=([^&]+)").unwrap_or_else(|e| panic!("invalid payee pattern: {e}"))
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_no: String,
    pub status: String,
    pub return_url: String,
}

/// Wallet deep links for the UPI payment page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpiLinks {
    pub default: String,
    pub bhim: String,
    pub gpay: String,
    pub paytm: String,
    pub phonepe: String,
    pub upi: String,
    /// Payee address taken from the `pa=` field of the generic UPI link.
    pub pa: String,
}

impl UpiLinks {
    pub fn from_wallets(wallets: &[WalletInfo]) -> Self {
        let mut links = UpiLinks::default();
        for wallet in wallets {
            let url = wallet.pay_url.clone();
            match wallet.wallet_code.as_str() {
                "upi" => {
                    links.pa = payee_address(&url).unwrap_or_default();
                    links.default = url.clone();
                    links.upi = url;
                }
                "bhim" => links.bhim = url,
                "gpay" => links.gpay = url,
                "paytm" => links.paytm = url,
                "phonepe" => links.phonepe = url,
                other => debug!(wallet_code = %other, "Ignoring unknown wallet"),
            }
        }
        links
    }
}

fn payee_address(url: &str) -> Option<String> {
    PAYEE_ADDRESS
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub pay_type: Option<String>,
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderStatus>, ApiError> {
    let order = state.orders.order_state_by_upi_id(&id).await?;

    Ok(Json(OrderStatus {
        order_no: id,
        status: order.status,
        return_url: order.return_url,
    }))
}

pub async fn upi(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResponseBody<UpiLinks>>, ApiError> {
    let raw = state.orders.wallets_raw(&id).await?;
    state.stats.submit(StatsRecord::access(&id));

    let wallets = OrderCache::decode_wallets(&id, &raw)?;
    Ok(Json(ResponseBody::success(UpiLinks::from_wallets(&wallets))))
}

pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ResponseBody<()>>, ApiError> {
    let id = query
        .id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::ParamBind("Missing id parameter".to_string()))?;
    let pay_type = query
        .pay_type
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::ParamBind("Missing pay_type parameter".to_string()))?;

    match pay_type.parse::<PayType>() {
        Ok(pay_type) => state.stats.submit(StatsRecord::click(id, pay_type)),
        Err(e) => debug!(upi_id = %id, error = %e, "Click not recorded"),
    }

    Ok(Json(ResponseBody::success(())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(code: &str, url: &str) -> WalletInfo {
        WalletInfo {
            wallet_name: code.to_uppercase(),
            wallet_code: code.to_string(),
            pay_url: url.to_string(),
        }
    }

    #[test]
    fn test_links_by_wallet_code() {
        let links = UpiLinks::from_wallets(&[
            wallet("upi", "upi://pay?pa=merchant@bank&pn=Shop&am=100.00"),
            wallet("paytm", "paytmmp://pay?pa=merchant@bank"),
            wallet("phonepe", "phonepe://pay?pa=merchant@bank"),
            wallet("unknown", "x://y"),
        ]);

        assert_eq!(links.upi, "upi://pay?pa=merchant@bank&pn=Shop&am=100.00");
        assert_eq!(links.default, links.upi);
        assert_eq!(links.pa, "merchant@bank");
        assert_eq!(links.paytm, "paytmmp://pay?pa=merchant@bank");
        assert_eq!(links.phonepe, "phonepe://pay?pa=merchant@bank");
        assert!(links.gpay.is_empty());
        assert!(links.bhim.is_empty());
    }

    #[test]
    fn test_link_without_payee() {
        let links = UpiLinks::from_wallets(&[wallet("upi", "upi://pay?pn=Shop")]);
        assert_eq!(links.pa, "");
        assert_eq!(links.upi, "upi://pay?pn=Shop");
    }
}
