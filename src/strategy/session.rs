//! Vietnam trading sessions (UTC+7).

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;

use crate::strategy::decision::Locale;

const VIETNAM_OFFSET_SECS: i32 = 7 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    /// 09:00-11:00, favours selling.
    Morning,
    /// 15:00-18:00, favours buying.
    Afternoon,
    /// 20:00-23:00, follows BTC.
    Evening,
    OffPeak,
}

impl Session {
    pub fn at_hour(hour: u32) -> Self {
        match hour {
            9..=10 => Self::Morning,
            15..=17 => Self::Afternoon,
            20..=22 => Self::Evening,
            _ => Self::OffPeak,
        }
    }

    /// Off-peak hours count as favouring selling.
    pub fn favors_buying(self, btc_favors_buying: bool) -> bool {
        match self {
            Self::Morning | Self::OffPeak => false,
            Self::Afternoon => true,
            Self::Evening => btc_favors_buying,
        }
    }

    pub fn label(self, locale: Locale) -> &'static str {
        match (self, locale) {
            (Self::Morning, Locale::Vi) => "Phiên sáng (9h-11h)",
            (Self::Afternoon, Locale::Vi) => "Phiên chiều (15h-18h)",
            (Self::Evening, Locale::Vi) => "Phiên tối (20h-23h)",
            (Self::OffPeak, Locale::Vi) => "Ngoài giờ cao điểm",
            (Self::Morning, Locale::En) => "Morning session (9:00-11:00)",
            (Self::Afternoon, Locale::En) => "Afternoon session (15:00-18:00)",
            (Self::Evening, Locale::En) => "Evening session (20:00-23:00)",
            (Self::OffPeak, Locale::En) => "Off-peak hours",
        }
    }
}

/// Hour of day in Vietnam time.
pub fn vietnam_hour(now: DateTime<Utc>) -> u32 {
    match FixedOffset::east_opt(VIETNAM_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset).hour(),
        None => (now.hour() + 7) % 24,
    }
}
