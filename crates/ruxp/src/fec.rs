use std::collections::HashMap;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

pub const FEC_DATA_SHARDS: usize = 3;
pub const FEC_PARITY_SHARDS: usize = 2;

const FEC_CMD_DATA: u16 = 0x0F;
const FEC_CMD_PARITY: u16 = 0x0E;

// Shard layout: |seq(4)|cmd(2)|rawLen(2)|payload|padding|. The parity
// code runs over everything from rawLen onward; seq and cmd stay plain.
const FEC_HEADER_OFFSET: usize = 6;
const FEC_HEADER_SIZE: usize = 8;

const FEC_RESULT_SIZE: usize = 50;
const FEC_DATA_TIMEOUT_MS: u32 = 10_000;

/// A partial group older than this is completed with padding shards by
/// the connection's update tick, so the tail of a burst never sits in
/// the encoder waiting for unrelated traffic.
pub(crate) const FEC_FLUSH_TIMEOUT_MS: u32 = 100;

fn is_fec_shard(data: &[u8]) -> bool {
    if data.len() < FEC_HEADER_SIZE {
        return false;
    }
    let cmd = u16::from_le_bytes([data[4], data[5]]);
    cmd == FEC_CMD_DATA || cmd == FEC_CMD_PARITY
}

/// Groups outbound cipher datagrams into `k` data shards and emits them
/// together with `m` parity shards.
pub(crate) struct FecEncoder {
    rs: ReedSolomon,
    shards: Vec<Vec<u8>>,
    insert_index: usize,
    next_seq: u32,
    data_shards: usize,
    parity_shards: usize,
    max_raw_len: usize,
    last_insert_ms: u32,
    buffer_size: usize,
}

impl FecEncoder {
    pub(crate) fn new(data_shards: usize, parity_shards: usize, buffer_size: usize) -> FecEncoder {
        let total = data_shards + parity_shards;
        FecEncoder {
            rs: ReedSolomon::new(data_shards, parity_shards)
                .expect("invalid fec shard configuration"),
            shards: (0..total)
                .map(|_| Vec::with_capacity(buffer_size + FEC_HEADER_SIZE))
                .collect(),
            insert_index: 0,
            next_seq: 0,
            data_shards,
            parity_shards,
            max_raw_len: 0,
            last_insert_ms: 0,
            buffer_size,
        }
    }

    /// Insert one cipher datagram into the current group. Returns the
    /// complete `k + m` shard group once the k-th datagram arrives; the
    /// caller must put every returned shard on the wire.
    pub(crate) fn encode(&mut self, raw: &[u8], now_ms: u32) -> Result<Option<&[Vec<u8>]>> {
        assert!(
            !raw.is_empty() && raw.len() <= self.buffer_size,
            "fec payload length {} out of range",
            raw.len()
        );
        self.push(raw, now_ms)
    }

    /// True when a partial group has been waiting longer than the flush
    /// window.
    pub(crate) fn should_flush(&self, now_ms: u32) -> bool {
        self.insert_index > 0
            && now_ms.wrapping_sub(self.last_insert_ms) > FEC_FLUSH_TIMEOUT_MS
    }

    /// Complete the pending group with zero-length padding payloads and
    /// emit it. Returns `None` when no group is pending.
    pub(crate) fn flush(&mut self, now_ms: u32) -> Result<Option<&[Vec<u8>]>> {
        if self.insert_index == 0 {
            return Ok(None);
        }
        while self.insert_index + 1 < self.data_shards {
            let emitted = self.push(&[], now_ms)?;
            debug_assert!(emitted.is_none());
        }
        self.push(&[], now_ms)
    }

    fn push(&mut self, raw: &[u8], now_ms: u32) -> Result<Option<&[Vec<u8>]>> {
        let slot = &mut self.shards[self.insert_index];
        slot.clear();
        slot.resize(FEC_HEADER_SIZE, 0);
        slot.extend_from_slice(raw);
        slot[FEC_HEADER_OFFSET..FEC_HEADER_SIZE]
            .copy_from_slice(&(raw.len() as u16).to_le_bytes());

        self.last_insert_ms = now_ms;
        self.max_raw_len = self.max_raw_len.max(raw.len());

        if self.insert_index + 1 < self.data_shards {
            self.insert_index += 1;
            return Ok(None);
        }
        self.seal().map(Some)
    }

    fn seal(&mut self) -> Result<&[Vec<u8>]> {
        let max_len = self.max_raw_len + FEC_HEADER_SIZE;
        let total = self.data_shards + self.parity_shards;
        for shard in self.shards.iter_mut() {
            shard.resize(max_len, 0);
        }

        {
            let mut regions: Vec<&mut [u8]> = self
                .shards
                .iter_mut()
                .map(|shard| &mut shard[FEC_HEADER_OFFSET..])
                .collect();
            self.rs.encode(&mut regions)?;
        }

        for i in 0..total {
            let cmd = if i < self.data_shards {
                FEC_CMD_DATA
            } else {
                FEC_CMD_PARITY
            };
            let shard = &mut self.shards[i];
            shard[..4].copy_from_slice(&self.next_seq.to_le_bytes());
            shard[4..FEC_HEADER_OFFSET].copy_from_slice(&cmd.to_le_bytes());
            self.next_seq = self.next_seq.wrapping_add(1);
        }

        self.insert_index = 0;
        self.max_raw_len = 0;
        Ok(&self.shards)
    }
}

struct FecGroup {
    /// Shard regions from `rawLen` onward, indexed by in-group slot.
    shards: Vec<Option<Vec<u8>>>,
    shard_count: usize,
    last_insert_ms: u32,
    /// Reconstructed already; absorbs late shards until the next sweep
    /// removes the group.
    decoded: bool,
}

/// Buffers incoming shards per group and reconstructs the original
/// cipher datagrams once any `k` of `k + m` shards have arrived.
pub(crate) struct FecDecoder {
    rs: ReedSolomon,
    data_shards: usize,
    total_shards: usize,
    groups: HashMap<u32, FecGroup>,
}

impl FecDecoder {
    pub(crate) fn new(data_shards: usize, parity_shards: usize) -> FecDecoder {
        FecDecoder {
            rs: ReedSolomon::new(data_shards, parity_shards)
                .expect("invalid fec shard configuration"),
            data_shards,
            total_shards: data_shards + parity_shards,
            groups: HashMap::new(),
        }
    }

    /// Ingest one datagram. `Err(UnknownFecCmd)` means the datagram is
    /// not a shard and should be parsed as a plain cipher datagram. A
    /// successful call returns every cipher datagram reconstructed by
    /// this ingest (possibly none, possibly from several groups).
    pub(crate) fn decode(&mut self, shard: &[u8], now_ms: u32) -> Result<Vec<Vec<u8>>> {
        if !is_fec_shard(shard) {
            return Err(Error::UnknownFecCmd);
        }

        let seq = u32::from_le_bytes([shard[0], shard[1], shard[2], shard[3]]);
        let start_range = seq - seq % self.total_shards as u32;
        let slot = (seq - start_range) as usize;

        let total = self.total_shards;
        let group = self.groups.entry(start_range).or_insert_with(|| FecGroup {
            shards: (0..total).map(|_| None).collect(),
            shard_count: 0,
            last_insert_ms: now_ms,
            decoded: false,
        });

        if group.decoded || group.shards[slot].is_some() {
            // Late or duplicate delivery; the first copy wins.
            tracing::trace!(seq, slot, "dropping duplicate fec shard");
        } else {
            group.shards[slot] = Some(shard[FEC_HEADER_OFFSET..].to_vec());
            group.shard_count += 1;
            group.last_insert_ms = now_ms;
        }

        self.sweep(now_ms)
    }

    fn sweep(&mut self, now_ms: u32) -> Result<Vec<Vec<u8>>> {
        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut remove: Vec<u32> = Vec::new();
        let mut failure: Option<Error> = None;

        for (key, group) in self.groups.iter_mut() {
            if group.decoded {
                remove.push(*key);
                continue;
            }
            if out.len() + self.data_shards > FEC_RESULT_SIZE {
                break;
            }

            if group.shard_count >= self.data_shards {
                match Self::reconstruct(&self.rs, self.data_shards, group) {
                    Ok(mut payloads) => {
                        out.append(&mut payloads);
                        group.decoded = true;
                    }
                    Err(err) => {
                        failure = Some(err);
                        remove.push(*key);
                        break;
                    }
                }
            } else if now_ms.wrapping_sub(group.last_insert_ms) > FEC_DATA_TIMEOUT_MS {
                remove.push(*key);
            }
        }

        for key in remove {
            self.groups.remove(&key);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    fn reconstruct(
        rs: &ReedSolomon,
        data_shards: usize,
        group: &mut FecGroup,
    ) -> Result<Vec<Vec<u8>>> {
        rs.reconstruct_data(&mut group.shards)?;

        let mut payloads = Vec::with_capacity(data_shards);
        for slot in group.shards.iter().take(data_shards) {
            let Some(shard) = slot else { continue };
            let raw_len = u16::from_le_bytes([shard[0], shard[1]]) as usize;
            if raw_len == 0 {
                // Padding shard from a flushed partial group.
                continue;
            }
            if 2 + raw_len > shard.len() {
                tracing::warn!(raw_len, shard_len = shard.len(), "corrupt fec shard length");
                continue;
            }
            payloads.push(shard[2..2 + raw_len].to_vec());
        }
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_group(encoder: &mut FecEncoder, payloads: &[&[u8]], now_ms: u32) -> Vec<Vec<u8>> {
        let mut emitted = None;
        for (i, payload) in payloads.iter().enumerate() {
            let result = encoder.encode(payload, now_ms).unwrap();
            if i + 1 < payloads.len() {
                assert!(result.is_none(), "group sealed early at shard {i}");
            } else {
                emitted = result.map(|shards| shards.to_vec());
            }
        }
        emitted.expect("k-th shard must seal the group")
    }

    #[test]
    fn test_group_shape() {
        let mut encoder = FecEncoder::new(3, 2, 1400);
        let shards = encode_group(&mut encoder, &[b"one", b"twotwo", b"three"], 0);

        assert_eq!(shards.len(), 5);
        let max_len = shards.iter().map(Vec::len).max().unwrap();
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.len(), max_len);
            assert_eq!(u32::from_le_bytes(shard[..4].try_into().unwrap()), i as u32);
            let cmd = u16::from_le_bytes([shard[4], shard[5]]);
            if i < 3 {
                assert_eq!(cmd, FEC_CMD_DATA);
            } else {
                assert_eq!(cmd, FEC_CMD_PARITY);
            }
        }
    }

    #[test]
    fn test_any_k_of_n_reconstructs_in_order() {
        let payloads: [&[u8]; 3] = [
            b"fsfdsf43578239fsd",
            b"43534590234fasdbfnvjkashf",
            b"fwqefsdakfhjna;wiksdf9032475902347",
        ];

        // Every 3-subset of the 5 shards must recover all 3 payloads.
        for drop_a in 0..5 {
            for drop_b in (drop_a + 1)..5 {
                let mut encoder = FecEncoder::new(3, 2, 1400);
                let shards = encode_group(&mut encoder, &payloads, 0);
                let mut decoder = FecDecoder::new(3, 2);

                let mut recovered = Vec::new();
                for (i, shard) in shards.iter().enumerate() {
                    if i == drop_a || i == drop_b {
                        continue;
                    }
                    recovered.extend(decoder.decode(shard, 0).unwrap());
                }

                assert_eq!(recovered.len(), 3, "drop ({drop_a},{drop_b})");
                for (got, want) in recovered.iter().zip(payloads.iter()) {
                    assert_eq!(got.as_slice(), *want);
                }
            }
        }
    }

    #[test]
    fn test_consecutive_groups_keep_sequencing() {
        let mut encoder = FecEncoder::new(3, 2, 1400);
        let mut decoder = FecDecoder::new(3, 2);

        for round in 0u32..10 {
            let a = format!("round {round} first");
            let b = format!("round {round} second");
            let c = format!("round {round} third");
            let shards = encode_group(
                &mut encoder,
                &[a.as_bytes(), b.as_bytes(), c.as_bytes()],
                round,
            );
            assert_eq!(
                u32::from_le_bytes(shards[0][..4].try_into().unwrap()),
                round * 5
            );

            // Lose the first two data shards; parity must cover them.
            let mut recovered = Vec::new();
            for shard in &shards[2..] {
                recovered.extend(decoder.decode(shard, round).unwrap());
            }
            assert_eq!(recovered.len(), 3);
            assert_eq!(recovered[0], a.as_bytes());
            assert_eq!(recovered[1], b.as_bytes());
            assert_eq!(recovered[2], c.as_bytes());
        }
    }

    #[test]
    fn test_duplicate_shard_is_dropped() {
        let mut encoder = FecEncoder::new(3, 2, 1400);
        let shards = encode_group(&mut encoder, &[b"aa", b"bb", b"cc"], 0);
        let mut decoder = FecDecoder::new(3, 2);

        assert!(decoder.decode(&shards[0], 0).unwrap().is_empty());
        // The same shard again must not count toward the threshold.
        assert!(decoder.decode(&shards[0], 0).unwrap().is_empty());
        assert!(decoder.decode(&shards[1], 0).unwrap().is_empty());
        assert_eq!(decoder.groups.values().next().unwrap().shard_count, 2);

        let recovered = decoder.decode(&shards[4], 0).unwrap();
        assert_eq!(recovered.len(), 3);
    }

    #[test]
    fn test_stale_group_ages_out() {
        let mut encoder = FecEncoder::new(3, 2, 1400);
        let first = encode_group(&mut encoder, &[b"aa", b"bb", b"cc"], 0);
        let second = encode_group(&mut encoder, &[b"dd", b"ee", b"ff"], 0);

        let mut decoder = FecDecoder::new(3, 2);
        assert!(decoder.decode(&first[0], 0).unwrap().is_empty());
        assert_eq!(decoder.groups.len(), 1);

        // A shard from another group lands past the timeout; the stale
        // group is discarded and can no longer complete.
        assert!(decoder
            .decode(&second[0], FEC_DATA_TIMEOUT_MS + 1)
            .unwrap()
            .is_empty());
        assert_eq!(decoder.groups.len(), 1);
        assert!(!decoder.groups.contains_key(&0));
    }

    #[test]
    fn test_non_fec_datagram_signals_fallback() {
        let mut decoder = FecDecoder::new(3, 2);
        let garbage = [0u8; 32];
        assert!(matches!(
            decoder.decode(&garbage, 0),
            Err(Error::UnknownFecCmd)
        ));
        assert!(matches!(decoder.decode(&[], 0), Err(Error::UnknownFecCmd)));
    }

    #[test]
    fn test_flush_completes_partial_group() {
        let mut encoder = FecEncoder::new(3, 2, 1400);
        assert!(encoder.encode(b"lonely message", 0).unwrap().is_none());

        assert!(!encoder.should_flush(50));
        assert!(encoder.should_flush(FEC_FLUSH_TIMEOUT_MS + 1));

        let shards = encoder
            .flush(FEC_FLUSH_TIMEOUT_MS + 1)
            .unwrap()
            .expect("flush must emit the pending group")
            .to_vec();
        assert_eq!(shards.len(), 5);

        // Deliver only the parity side plus the real data shard; padding
        // shards reconstruct to zero-length and are discarded.
        let mut decoder = FecDecoder::new(3, 2);
        let mut recovered = Vec::new();
        for shard in [&shards[0], &shards[3], &shards[4]] {
            recovered.extend(decoder.decode(shard, 0).unwrap());
        }
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0], b"lonely message");

        // Nothing pending afterwards.
        assert!(encoder.flush(1000).unwrap().is_none());
    }
}
