//! Annex B (start-code delimited) H.264 helpers.

pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Split a byte stream at every start code. Each returned slice begins with
/// its own 3- or 4-byte start code. Bytes before the first start code are
/// discarded.
pub fn split_annexb(stream: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            let code_start = if i > 0 && stream[i - 1] == 0 { i - 1 } else { i };
            starts.push(code_start);
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(stream.len());
            &stream[start..end]
        })
        .collect()
}

/// The unit payload without its start code.
pub fn strip_start_code(unit: &[u8]) -> Option<&[u8]> {
    if unit.starts_with(&[0, 0, 0, 1]) {
        Some(&unit[4..])
    } else if unit.starts_with(&[0, 0, 1]) {
        Some(&unit[3..])
    } else {
        None
    }
}

/// `nal_unit_type` of a start-code-prefixed unit.
pub fn unit_type(unit: &[u8]) -> Option<u8> {
    strip_start_code(unit)?.first().map(|header| header & 0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_start_codes() {
        let stream = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4];
        let units = split_annexb(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0, 0, 0, 1, 0x67, 1, 2]);
        assert_eq!(units[1], &[0, 0, 1, 0x68, 3]);
        assert_eq!(units[2], &[0, 0, 0, 1, 0x65, 4]);
        let types: Vec<_> = units.iter().filter_map(|u| unit_type(u)).collect();
        assert_eq!(types, vec![NAL_SPS, NAL_PPS, NAL_IDR]);
    }

    #[test]
    fn no_start_code_yields_nothing() {
        assert!(split_annexb(&[0x65, 0x88, 0x00]).is_empty());
        assert!(split_annexb(&[]).is_empty());
        assert_eq!(unit_type(&[0x65]), None);
    }
}
