//! Response types for the Binance spot REST API.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Entry of /api/v3/ticker/price.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// Entry of /sapi/v1/spot/delist-schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelistSchedule {
    #[serde(default)]
    pub delist_time: i64,
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parses_ticker_prices_given_as_strings() {
        let body = r#"[{"symbol":"BTCUSDT","price":"67012.34000000"},{"symbol":"ETHBTC","price":"0.05"}]"#;
        let tickers: Vec<TickerPrice> = serde_json::from_str(body).unwrap();
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers[0].price, dec!(67012.34));
    }

    #[test]
    fn test_parses_delist_schedule_and_error_body() {
        let body = r#"[{"delistTime":1686161202000,"symbols":["ADAUSDT","ADABNB"]}]"#;
        let schedule: Vec<DelistSchedule> = serde_json::from_str(body).unwrap();
        assert_eq!(schedule[0].symbols, vec!["ADAUSDT", "ADABNB"]);

        let err: ApiErrorBody = serde_json::from_str(r#"{"code":-1121,"msg":"Invalid symbol."}"#).unwrap();
        assert_eq!(err.code, -1121);
    }
}
