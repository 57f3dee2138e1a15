//! Mobile network detection from Ghanaian MSISDN prefixes.

use serde::{Deserialize, Serialize};

const MTN_PREFIXES: &[&str] = &["024", "025", "053", "054", "055", "059"];
const VODAFONE_PREFIXES: &[&str] = &["020", "050"];
const ARTLTIGO_PREFIXES: &[&str] = &["026", "027", "057"];

const INTERNATIONAL_PREFIX: &str = "+233";
const LOCAL_NUMBER_LEN: usize = 10;

/// Mobile-money operator. `Unknown` serialises as the empty string, which is
/// what the payment API expects for an undetermined network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "MTN")]
    Mtn,
    #[serde(rename = "VODAFONE")]
    Vodafone,
    #[serde(rename = "ARTLTIGO")]
    Artltigo,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mtn => "MTN",
            Self::Vodafone => "VODAFONE",
            Self::Artltigo => "ARTLTIGO",
            Self::Unknown => "",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::Unknown
    }
}

/// Rewrite `+233XXXXXXXXX` to the local `0XXXXXXXXX` form and drop blanks.
pub fn normalize(msisdn: &str) -> String {
    let compact: String = msisdn.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.strip_prefix(INTERNATIONAL_PREFIX) {
        Some(rest) => format!("0{rest}"),
        None => compact,
    }
}

/// Detect the operator from the number prefix, local or international.
pub fn detect(msisdn: &str) -> Network {
    let local = normalize(msisdn);
    let Some(prefix) = local.get(..3) else {
        return Network::Unknown;
    };

    if MTN_PREFIXES.contains(&prefix) {
        Network::Mtn
    } else if VODAFONE_PREFIXES.contains(&prefix) {
        Network::Vodafone
    } else if ARTLTIGO_PREFIXES.contains(&prefix) {
        Network::Artltigo
    } else {
        Network::Unknown
    }
}

/// Whether a phone-field value should fire a name enquiry on its own.
///
/// Returns the normalised number and its network once the number is complete
/// (exactly ten local digits) and belongs to a known operator.
pub fn enquiry_trigger(msisdn: &str) -> Option<(String, Network)> {
    let local = normalize(msisdn);
    let network = detect(&local);
    (local.len() == LOCAL_NUMBER_LEN && network.is_known()).then_some((local, network))
}
