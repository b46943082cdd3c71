//! Token operations decoded from event payloads.
//!
//! Payloads follow the BSV-20/21 inscription format: a JSON object whose
//! values are strings, with amounts written as base-10 integers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SdkError;

/// Protocol tag accepted in the `p` field.
pub const PROTOCOL: &str = "bsv-20";

/// Maximum number of display decimals.
pub const MAX_DECIMALS: u8 = 18;

/// A decoded token operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TokenOp {
    /// Deploys the token and mints the whole supply to `to`.
    DeployMint {
        /// Recipient of the supply.
        to: String,
        /// Minted amount.
        amt: u64,
        /// Ticker symbol.
        sym: Option<String>,
        /// Display decimals.
        dec: u8,
    },

    /// Moves `amt` from `from` to `to`.
    Transfer {
        /// Debited holder.
        from: String,
        /// Credited holder.
        to: String,
        /// Transferred amount.
        amt: u64,
    },

    /// Destroys `amt` held by `from`.
    Burn {
        /// Debited holder.
        from: String,
        /// Burned amount.
        amt: u64,
    },
}

impl TokenOp {
    /// Decodes a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a well-formed operation.
    pub fn decode(payload: &str) -> Result<Self, SdkError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| SdkError::InvalidPayload(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| SdkError::InvalidPayload("expected a JSON object".to_string()))?;

        if let Some(p) = obj.get("p") {
            match p.as_str() {
                Some(PROTOCOL) => {}
                _ => return Err(SdkError::UnsupportedProtocol(p.to_string())),
            }
        }

        let op = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or(SdkError::MissingField("op"))?;

        match op {
            "deploy+mint" => {
                let dec = match obj.get("dec") {
                    Some(v) => parse_decimals(v)?,
                    None => 0,
                };
                Ok(Self::DeployMint {
                    to: holder(obj, "to")?,
                    amt: amount(obj)?,
                    sym: obj.get("sym").and_then(Value::as_str).map(str::to_string),
                    dec,
                })
            }
            "transfer" => {
                let from = holder(obj, "from")?;
                let to = holder(obj, "to")?;
                Ok(Self::Transfer {
                    from,
                    to,
                    amt: amount(obj)?,
                })
            }
            "burn" => Ok(Self::Burn {
                from: holder(obj, "from")?,
                amt: amount(obj)?,
            }),
            other => Err(SdkError::UnknownOperation(other.to_string())),
        }
    }

    /// Returns the operation amount.
    #[must_use]
    pub const fn amount(&self) -> u64 {
        match self {
            Self::DeployMint { amt, .. } | Self::Transfer { amt, .. } | Self::Burn { amt, .. } => {
                *amt
            }
        }
    }

    /// Returns the protocol name of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeployMint { .. } => "deploy+mint",
            Self::Transfer { .. } => "transfer",
            Self::Burn { .. } => "burn",
        }
    }

    /// Encodes the operation back into payload form.
    #[must_use]
    pub fn to_payload(&self) -> String {
        let mut obj = Map::new();
        obj.insert("p".to_string(), Value::from(PROTOCOL));
        obj.insert("op".to_string(), Value::from(self.as_str()));
        obj.insert("amt".to_string(), Value::from(self.amount().to_string()));
        match self {
            Self::DeployMint { to, sym, dec, .. } => {
                obj.insert("to".to_string(), Value::from(to.as_str()));
                obj.insert("dec".to_string(), Value::from(dec.to_string()));
                if let Some(sym) = sym {
                    obj.insert("sym".to_string(), Value::from(sym.as_str()));
                }
            }
            Self::Transfer { from, to, .. } => {
                obj.insert("from".to_string(), Value::from(from.as_str()));
                obj.insert("to".to_string(), Value::from(to.as_str()));
            }
            Self::Burn { from, .. } => {
                obj.insert("from".to_string(), Value::from(from.as_str()));
            }
        }
        Value::Object(obj).to_string()
    }
}

fn holder(obj: &Map<String, Value>, field: &'static str) -> Result<String, SdkError> {
    let value = obj
        .get(field)
        .and_then(Value::as_str)
        .ok_or(SdkError::MissingField(field))?;
    let value = value.trim();
    if value.is_empty() || value.contains(':') || value.contains(char::is_whitespace) {
        return Err(SdkError::InvalidHolder(value.to_string()));
    }
    Ok(value.to_string())
}

fn amount(obj: &Map<String, Value>) -> Result<u64, SdkError> {
    let value = obj.get("amt").ok_or(SdkError::MissingField("amt"))?;
    let amt = match value {
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| SdkError::InvalidAmount(s.clone()))?,
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| SdkError::InvalidAmount(n.to_string()))?,
        other => return Err(SdkError::InvalidAmount(other.to_string())),
    };
    if amt == 0 {
        return Err(SdkError::InvalidAmount("0".to_string()));
    }
    Ok(amt)
}

fn parse_decimals(value: &Value) -> Result<u8, SdkError> {
    let dec = match value {
        Value::String(s) => s.parse::<u8>().ok(),
        Value::Number(n) => n.as_u64().and_then(|d| u8::try_from(d).ok()),
        _ => None,
    };
    match dec {
        Some(d) if d <= MAX_DECIMALS => Ok(d),
        _ => Err(SdkError::InvalidDecimals(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_transfer() {
        let op = TokenOp::decode(r#"{"p":"bsv-20","op":"transfer","amt":"100","from":"A","to":"B"}"#)
            .expect("decode");
        assert_eq!(
            op,
            TokenOp::Transfer {
                from: "A".to_string(),
                to: "B".to_string(),
                amt: 100
            }
        );
    }

    #[test]
    fn test_decode_deploy_mint() {
        let op = TokenOp::decode(
            r#"{"p":"bsv-20","op":"deploy+mint","amt":"150","to":"A","sym":"TKN","dec":"8"}"#,
        )
        .expect("decode");
        assert_eq!(
            op,
            TokenOp::DeployMint {
                to: "A".to_string(),
                amt: 150,
                sym: Some("TKN".to_string()),
                dec: 8
            }
        );
    }

    #[test]
    fn test_decode_numeric_amount() {
        let op = TokenOp::decode(r#"{"op":"burn","amt":20,"from":"C"}"#).expect("decode");
        assert_eq!(op.amount(), 20);
        assert_eq!(op.as_str(), "burn");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            TokenOp::decode("not json"),
            Err(SdkError::InvalidPayload(_))
        ));
        assert!(matches!(
            TokenOp::decode("[1,2]"),
            Err(SdkError::InvalidPayload(_))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"op":"mint","amt":"1","to":"A"}"#),
            Err(SdkError::UnknownOperation(_))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"op":"transfer","amt":"1","to":"A"}"#),
            Err(SdkError::MissingField("from"))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"op":"transfer","amt":"-1","from":"A","to":"B"}"#),
            Err(SdkError::InvalidAmount(_))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"op":"transfer","amt":"0","from":"A","to":"B"}"#),
            Err(SdkError::InvalidAmount(_))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"p":"brc-20","op":"transfer","amt":"1","from":"A","to":"B"}"#),
            Err(SdkError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            TokenOp::decode(r#"{"op":"transfer","amt":"1","from":"A:1","to":"B"}"#),
            Err(SdkError::InvalidHolder(_))
        ));
    }

    #[test]
    fn test_decode_rejects_excess_decimals() {
        let err = TokenOp::decode(r#"{"op":"deploy+mint","amt":"1","to":"A","dec":"19"}"#);
        assert!(matches!(err, Err(SdkError::InvalidDecimals(_))));
    }

    #[test]
    fn test_payload_roundtrip() {
        let op = TokenOp::Burn {
            from: "A".to_string(),
            amt: 5,
        };
        assert_eq!(TokenOp::decode(&op.to_payload()).expect("decode"), op);
    }
}
