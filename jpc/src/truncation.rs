use log::debug;

use super::codeblock::CodeBlockTable;

/// Fits the code-block contributions of a fully parsed tile into
/// `allowance`, layer by layer and code-block by code-block in key order.
///
/// A packet header is paid for the first time one of its code-blocks is
/// visited. Once a header or a contribution does not fit, that contribution
/// and every one visited after it is dropped from the table, so that the
/// decoded layers stay a prefix of the quality progression.
///
/// Returns the number of bytes charged. `allowance` is left with what is
/// unused.
pub(crate) fn simulate_layer_truncation(
    table: &mut CodeBlockTable,
    packet_header_lengths: &[u64],
    allowance: &mut u64,
) -> u64 {
    let mut unpaid_headers = packet_header_lengths.to_vec();
    let slots = table.slots_in_order();
    let mut consumed = 0;
    let mut reject = false;
    let mut dropped = 0usize;

    for layer in 0..table.num_layers() {
        for &slot in slots.iter() {
            let record = table.slot_mut(slot);

            if !reject {
                let packet = record.packet_index(layer);
                let header_length = packet
                    .and_then(|packet| unpaid_headers.get(packet).copied())
                    .unwrap_or(0);
                if *allowance < header_length {
                    reject = true;
                } else {
                    *allowance -= header_length;
                    consumed += header_length;
                    if let Some(packet) = packet {
                        if let Some(unpaid) = unpaid_headers.get_mut(packet) {
                            *unpaid = 0;
                        }
                    }
                }
            }

            let length = u64::from(record.length(layer));
            if length == 0 {
                continue;
            }
            if !reject && length < *allowance {
                *allowance -= length;
                consumed += length;
            } else {
                record.drop_layer(layer);
                reject = true;
                dropped += 1;
            }
        }
    }

    debug!(
        "Layer truncation kept {} bytes, dropped {} contributions, {} bytes left",
        consumed, dropped, allowance
    );
    consumed
}
