//! Selection criteria applied to trusses before any full parse

use crate::context::ActiveContext;
use crate::types::{SourceKind, Truss};
use chrono::{DateTime, Local, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

/// A legacy device family accepted in place of `device`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAlias {
    /// Active device name the alias applies to
    pub device: String,
    /// Truss device names starting with this prefix are compatible
    pub prefix: String,
}

/// Reason a truss was not selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Device,
    Channel,
    TooOld,
    ObjectKey,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rejection::Device => "device mismatch",
            Rejection::Channel => "channel not in mix",
            Rejection::TooOld => "older than retrospect window",
            Rejection::ObjectKey => "object key mismatch",
        })
    }
}

/// Snapshot of the active selection for one rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub device_name: String,
    pub device_aliases: Vec<DeviceAlias>,
    pub channel_mix: BTreeSet<u32>,
    pub min_start_timestamp_ms: i64,
    /// Empty when no object is selected
    pub active_object_key: String,
    pub ignore_log_object_key: bool,
    /// Lowercase
    pub realized_object_keys: BTreeSet<String>,
}

impl SelectionCriteria {
    pub fn from_context(ctx: &ActiveContext, device_aliases: &[DeviceAlias], now: DateTime<Local>) -> Self {
        Self {
            device_name: ctx.device.name.clone(),
            device_aliases: device_aliases.to_vec(),
            channel_mix: ctx.channel_mix_numbers(),
            min_start_timestamp_ms: retrospect_cutoff_ms(now, ctx.retrospect_months),
            active_object_key: ctx.object_key.clone(),
            ignore_log_object_key: ctx.ignore_log_object_key,
            realized_object_keys: ctx
                .realized_object_keys
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    /// Apply the rules in order and return the first violated one
    pub fn check(&self, truss: &Truss) -> Result<(), Rejection> {
        match truss.kind {
            SourceKind::SelfDescribing => {
                if !self.is_matching_device(&truss.device_name) {
                    return Err(Rejection::Device);
                }
                if !self.channel_mix.contains(&truss.channel_number) {
                    return Err(Rejection::Channel);
                }
                if truss.start_timestamp_ms < self.min_start_timestamp_ms {
                    return Err(Rejection::TooOld);
                }
                if !self.is_matching_object(truss) {
                    return Err(Rejection::ObjectKey);
                }
            }
            SourceKind::ImportRaw => {
                if truss.start_timestamp_ms < self.min_start_timestamp_ms {
                    return Err(Rejection::TooOld);
                }
                if self.has_object_key()
                    && !truss.object_key.eq_ignore_ascii_case(&self.active_object_key)
                    && !self.ignore_log_object_key
                {
                    return Err(Rejection::ObjectKey);
                }
            }
        }
        Ok(())
    }

    /// Like [`check`](Self::check), logging rejections at INFO
    pub fn accepts(&self, truss: &Truss) -> bool {
        match self.check(truss) {
            Ok(()) => true,
            Err(reason) => {
                info!(
                    file = %truss.source_path.display(),
                    recordset = %truss.recordset_base_name,
                    device = %truss.device_name,
                    channel = truss.channel_number,
                    object_key = %truss.object_key,
                    %reason,
                    "Truss not selected"
                );
                false
            }
        }
    }

    pub fn has_object_key(&self) -> bool {
        !self.active_object_key.is_empty()
    }

    fn is_matching_device(&self, device_name: &str) -> bool {
        device_name == self.device_name
            || self
                .device_aliases
                .iter()
                .any(|a| a.device == self.device_name && device_name.starts_with(&a.prefix))
    }

    fn is_realized(&self, key: &str) -> bool {
        self.realized_object_keys.contains(&key.to_lowercase())
    }

    fn is_matching_object(&self, truss: &Truss) -> bool {
        if !self.has_object_key() {
            if truss.object_key.is_empty() {
                info!(file = %truss.source_path.display(), "Accepting truss without object key");
            }
            return true;
        }
        if truss.object_key.is_empty() {
            return self.ignore_log_object_key;
        }
        if !self.is_realized(&truss.object_key) {
            // unknown keys count if the file sits in a known object folder
            return self.ignore_log_object_key
                || (!truss.object_directory.is_empty() && self.is_realized(&truss.object_directory));
        }
        truss.object_key.eq_ignore_ascii_case(&self.active_object_key)
    }
}

/// `now` minus `months`, at the start of that local day
pub fn retrospect_cutoff_ms(now: DateTime<Local>, months: u32) -> i64 {
    let date = now
        .date_naive()
        .checked_sub_months(Months::new(months))
        .unwrap_or(chrono::NaiveDate::MIN);
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return i64::MIN;
    };
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        // midnight skipped by a DST jump: fall back to the UTC reading
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight).timestamp_millis())
}
