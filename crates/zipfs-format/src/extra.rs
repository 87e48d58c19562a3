//! Unix extra-field records attached to archive entries.
//!
//! Three tags are understood on read: the extended timestamp field
//! (0x5455), the Info-ZIP "new" Unix field (0x7875) and the obsolete
//! Info-ZIP Unix field (0x5855). On write only the first two are
//! emitted; rewriting them is idempotent.

use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};

/// Extended timestamp field ("UT").
pub const EXTENDED_TIMESTAMP: u16 = 0x5455;
/// Info-ZIP Unix field, third generation ("ux"): variable-width uid/gid.
pub const INFOZIP_UNIX_NEW: u16 = 0x7875;
/// Original Info-ZIP Unix field ("UX"): atime, mtime, 16-bit uid/gid.
pub const INFOZIP_UNIX_OLD: u16 = 0x5855;

const MTIME_PRESENT: u8 = 1 << 0;
const ATIME_PRESENT: u8 = 1 << 1;
const CRETIME_PRESENT: u8 = 1 << 2;

/// Unix metadata recovered from an entry's extra fields.
///
/// Fields missing from the archive stay `None`; the filesystem layer
/// substitutes its defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnixExtra {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub cretime: Option<i64>,
}

/// Walk the raw extra-field block of a local header.
///
/// Records are processed in order of appearance; a later record
/// overrides fields set by an earlier one.
pub fn parse(extra: &[u8]) -> UnixExtra {
    let mut out = UnixExtra::default();
    let mut rest = extra;
    while rest.len() >= 4 {
        let tag = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if len > rest.len() {
            break;
        }
        let data = &rest[..len];
        match tag {
            EXTENDED_TIMESTAMP => parse_timestamp(data, &mut out),
            INFOZIP_UNIX_NEW => parse_unix_new(data, &mut out),
            INFOZIP_UNIX_OLD => parse_unix_old(data, &mut out),
            _ => {}
        }
        rest = &rest[len..];
    }
    out
}

fn parse_timestamp(data: &[u8], out: &mut UnixExtra) {
    let Some((&flags, mut times)) = data.split_first() else {
        return;
    };
    let mut next = |wanted: bool| -> Option<i64> {
        if !wanted || times.len() < 4 {
            return None;
        }
        let t = i32::from_le_bytes([times[0], times[1], times[2], times[3]]);
        times = &times[4..];
        Some(t as i64)
    };
    if let Some(t) = next(flags & MTIME_PRESENT != 0) {
        out.mtime = Some(t);
    }
    if let Some(t) = next(flags & ATIME_PRESENT != 0) {
        out.atime = Some(t);
    }
    if let Some(t) = next(flags & CRETIME_PRESENT != 0) {
        out.cretime = Some(t);
    }
}

fn parse_unix_new(data: &[u8], out: &mut UnixExtra) {
    // version(1) uid_size(1) uid gid_size(1) gid
    if data.first() != Some(&1) {
        return;
    }
    let mut rest = &data[1..];
    let mut next = || -> Option<u32> {
        let (&size, tail) = rest.split_first()?;
        let size = size as usize;
        if size > tail.len() || size > 8 {
            return None;
        }
        let mut value = [0u8; 8];
        value[..size].copy_from_slice(&tail[..size]);
        rest = &tail[size..];
        Some(u64::from_le_bytes(value) as u32)
    };
    if let Some(uid) = next() {
        out.uid = Some(uid);
    }
    if let Some(gid) = next() {
        out.gid = Some(gid);
    }
}

fn parse_unix_old(data: &[u8], out: &mut UnixExtra) {
    if data.len() >= 8 {
        out.atime = Some(i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64);
        out.mtime = Some(i32::from_le_bytes([data[4], data[5], data[6], data[7]]) as i64);
    }
    if data.len() >= 12 {
        out.uid = Some(u16::from_le_bytes([data[8], data[9]]) as u32);
        out.gid = Some(u16::from_le_bytes([data[10], data[11]]) as u32);
    }
}

/// Payload of the extended timestamp field for a local header.
pub fn timestamp_field(mtime: i64, atime: i64, cretime: Option<i64>) -> Vec<u8> {
    let mut flags = MTIME_PRESENT | ATIME_PRESENT;
    if cretime.is_some() {
        flags |= CRETIME_PRESENT;
    }
    let mut data = Vec::with_capacity(13);
    data.push(flags);
    data.extend_from_slice(&(mtime as i32).to_le_bytes());
    data.extend_from_slice(&(atime as i32).to_le_bytes());
    if let Some(t) = cretime {
        data.extend_from_slice(&(t as i32).to_le_bytes());
    }
    data
}

/// Payload of the Info-ZIP "new" Unix field.
pub fn unix_field(uid: u32, gid: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(11);
    data.push(1); // version
    data.push(4);
    data.extend_from_slice(&uid.to_le_bytes());
    data.push(4);
    data.extend_from_slice(&gid.to_le_bytes());
    data
}

/// Convert an entry's DOS timestamp (local time) to a Unix timestamp.
pub fn dos_to_unix(dt: &zip::DateTime) -> Option<i64> {
    let date = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let naive = date.and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
}

/// Convert a Unix timestamp to the DOS format stored in entry headers.
///
/// DOS times cannot represent dates before 1980 or after 2107; out of
/// range values are clamped to the epoch default.
pub fn unix_to_dos(t: i64) -> zip::DateTime {
    let Some(local) = Local.timestamp_opt(t, 0).earliest() else {
        return zip::DateTime::default();
    };
    let naive = local.naive_local();
    if naive.year() < 1980 || naive.year() > 2107 {
        return zip::DateTime::default();
    }
    zip::DateTime::from_date_and_time(
        naive.year() as u16,
        naive.month() as u8,
        naive.day() as u8,
        naive.hour() as u8,
        naive.minute() as u8,
        // DOS times have two-second resolution; from_date_and_time
        // accepts odd seconds and rounds during encoding.
        naive.second() as u8,
    )
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(tag: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn timestamp_and_unix_round_trip() {
        let mut blob = framed(EXTENDED_TIMESTAMP, &timestamp_field(1_600_000_000, 1_500_000_000, Some(1_400_000_000)));
        blob.extend(framed(INFOZIP_UNIX_NEW, &unix_field(1000, 2000)));

        let parsed = parse(&blob);
        assert_eq!(parsed.mtime, Some(1_600_000_000));
        assert_eq!(parsed.atime, Some(1_500_000_000));
        assert_eq!(parsed.cretime, Some(1_400_000_000));
        assert_eq!(parsed.uid, Some(1000));
        assert_eq!(parsed.gid, Some(2000));
    }

    #[test]
    fn timestamp_without_creation_time() {
        let blob = framed(EXTENDED_TIMESTAMP, &timestamp_field(100, 200, None));
        let parsed = parse(&blob);
        assert_eq!(parsed.mtime, Some(100));
        assert_eq!(parsed.atime, Some(200));
        assert_eq!(parsed.cretime, None);
    }

    #[test]
    fn timestamp_with_only_mtime_flag() {
        let data = [MTIME_PRESENT, 0x40, 0xe2, 0x01, 0x00]; // 123456
        let parsed = parse(&framed(EXTENDED_TIMESTAMP, &data));
        assert_eq!(parsed.mtime, Some(123_456));
        assert_eq!(parsed.atime, None);
    }

    #[test]
    fn old_unix_field_is_accepted() {
        let mut data = Vec::new();
        data.extend_from_slice(&200i32.to_le_bytes());
        data.extend_from_slice(&100i32.to_le_bytes());
        data.extend_from_slice(&42u16.to_le_bytes());
        data.extend_from_slice(&43u16.to_le_bytes());
        let parsed = parse(&framed(INFOZIP_UNIX_OLD, &data));
        assert_eq!(parsed.atime, Some(200));
        assert_eq!(parsed.mtime, Some(100));
        assert_eq!(parsed.uid, Some(42));
        assert_eq!(parsed.gid, Some(43));
    }

    #[test]
    fn later_record_overrides_earlier() {
        let mut old = Vec::new();
        old.extend_from_slice(&1i32.to_le_bytes());
        old.extend_from_slice(&2i32.to_le_bytes());
        old.extend_from_slice(&7u16.to_le_bytes());
        old.extend_from_slice(&8u16.to_le_bytes());
        let mut blob = framed(INFOZIP_UNIX_OLD, &old);
        blob.extend(framed(INFOZIP_UNIX_NEW, &unix_field(501, 502)));
        let parsed = parse(&blob);
        assert_eq!(parsed.uid, Some(501));
        assert_eq!(parsed.gid, Some(502));
    }

    #[test]
    fn truncated_and_unknown_records_are_skipped() {
        let mut blob = framed(0xcafe, b"opaque");
        blob.extend(framed(INFOZIP_UNIX_NEW, &unix_field(11, 12)));
        blob.extend_from_slice(&[0x55, 0x54, 0xff]); // torn trailing record
        let parsed = parse(&blob);
        assert_eq!(parsed.uid, Some(11));
        assert_eq!(parsed.gid, Some(12));
    }

    #[test]
    fn dos_conversion_round_trips_to_two_seconds() {
        let t = 1_700_000_000;
        let dt = unix_to_dos(t);
        let back = dos_to_unix(&dt).unwrap();
        assert!((back - t).abs() < 2);
    }

    #[test]
    fn pre_1980_times_clamp_to_epoch_default() {
        let dt = unix_to_dos(0);
        assert_eq!(dt.year(), 1980);
    }
}
