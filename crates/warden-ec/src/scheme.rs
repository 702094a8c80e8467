//! Erasure scheme.
//!
//! Wraps systematic Reed-Solomon over GF(2^8). A segment is padded to a
//! whole number of stripes, split into `required` data pieces, and encoded
//! into `total` pieces; piece `i` is shard `i` of the codeword. Because the
//! field arithmetic is byte-position-wise, any aligned byte range taken
//! across all pieces (a stripe of shares) forms a codeword of the same
//! scheme; that is what lets the audit path check a single random stripe
//! instead of whole pieces.
//!
//! The backing library encodes, reconstructs, and verifies, but does not
//! locate corrupted shards, so [`Scheme::correct`] adds location by
//! leave-one-out consensus: reconstruct with each present shard excluded
//! in turn and keep the exclusion that yields a consistent codeword
//! disagreeing only with the excluded shard. One corrupted shard is
//! locatable when at least `required + 2` shards are present; anything
//! less is reported as undetermined corruption and the caller treats the
//! read as failed.

use reed_solomon_erasure::galois_8::ReedSolomon;
use snafu::Snafu;

use warden_core::RedundancyScheme;

/// Errors from erasure coding.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemeError {
    /// The redundancy parameters cannot back a Reed-Solomon code.
    #[snafu(display("unsupported redundancy scheme: {message}"))]
    InvalidScheme { message: String },

    /// Shares passed in are malformed (wrong sizes, duplicate numbers).
    #[snafu(display("malformed shares: {message}"))]
    MalformedShares { message: String },

    /// Too few shares to reconstruct.
    #[snafu(display("not enough shares: got {got}, required {required}"))]
    NotEnoughShares { got: usize, required: usize },

    /// Shares are inconsistent and no single corrupted shard could be
    /// pinned down.
    #[snafu(display("shares are inconsistent; corruption could not be located"))]
    CorruptionUndetermined,

    /// The Reed-Solomon backend failed.
    #[snafu(display("erasure backend error: {message}"))]
    Backend { message: String },
}

/// Outcome of [`Scheme::correct`].
#[derive(Debug, Clone)]
pub struct Correction {
    /// The full consistent codeword, one shard per piece number.
    pub shards: Vec<Vec<u8>>,
    /// Piece numbers whose submitted content disagreed with the codeword.
    pub bad_piece_nums: Vec<u16>,
}

impl Correction {
    /// The decoded data prefix (first `required` shards concatenated).
    pub fn data(&self, required: u16) -> Vec<u8> {
        let mut out = Vec::new();
        for shard in self.shards.iter().take(usize::from(required)) {
            out.extend_from_slice(shard);
        }
        out
    }
}

/// Systematic Reed-Solomon codec for one redundancy scheme.
pub struct Scheme {
    rs: ReedSolomon,
    redundancy: RedundancyScheme,
}

impl Scheme {
    pub fn new(redundancy: RedundancyScheme) -> Result<Self, SchemeError> {
        redundancy.validate().map_err(|e| SchemeError::InvalidScheme {
            message: e.to_string(),
        })?;
        if redundancy.total == redundancy.required {
            return Err(SchemeError::InvalidScheme {
                message: "scheme carries no parity pieces".to_string(),
            });
        }
        let rs = ReedSolomon::new(
            usize::from(redundancy.required),
            usize::from(redundancy.total - redundancy.required),
        )
        .map_err(|e| SchemeError::Backend {
            message: e.to_string(),
        })?;
        Ok(Scheme { rs, redundancy })
    }

    pub fn redundancy(&self) -> &RedundancyScheme {
        &self.redundancy
    }

    /// Encode a segment into `total` equally sized pieces.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, SchemeError> {
        let required = usize::from(self.redundancy.required);
        let total = usize::from(self.redundancy.total);
        let piece_size = self.redundancy.piece_size(data.len() as u64) as usize;

        let mut shards = vec![vec![0u8; piece_size]; total];
        for (i, chunk) in data.chunks(piece_size).enumerate().take(required) {
            shards[i][..chunk.len()].copy_from_slice(chunk);
        }

        self.rs.encode(&mut shards).map_err(|e| SchemeError::Backend {
            message: e.to_string(),
        })?;
        Ok(shards)
    }

    /// Reconstruct the segment from any `required` pieces.
    ///
    /// `shards` is indexed by piece number; missing pieces are `None`.
    /// Returns the plaintext truncated to `segment_size`.
    pub fn decode(
        &self,
        mut shards: Vec<Option<Vec<u8>>>,
        segment_size: u64,
    ) -> Result<Vec<u8>, SchemeError> {
        let required = usize::from(self.redundancy.required);
        let present = shards.iter().flatten().count();
        if present < required {
            return Err(SchemeError::NotEnoughShares {
                got: present,
                required,
            });
        }

        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| SchemeError::Backend {
                message: e.to_string(),
            })?;

        let mut data = Vec::with_capacity(self.redundancy.padded_size(segment_size) as usize);
        for shard in shards.iter().take(required) {
            match shard {
                Some(bytes) => data.extend_from_slice(bytes),
                None => {
                    return Err(SchemeError::Backend {
                        message: "data shard missing after reconstruction".to_string(),
                    })
                }
            }
        }
        data.truncate(segment_size as usize);
        Ok(data)
    }

    /// Reconstruct a consistent codeword and locate disagreeing shards.
    ///
    /// See the module docs for the location algorithm and its limits.
    pub fn correct(&self, shares: &[(u16, Vec<u8>)]) -> Result<Correction, SchemeError> {
        let required = usize::from(self.redundancy.required);
        let total = usize::from(self.redundancy.total);

        self.check_shares(shares)?;
        if shares.len() < required {
            return Err(SchemeError::NotEnoughShares {
                got: shares.len(),
                required,
            });
        }

        // fast path: everything already consistent
        if let Some(shards) = self.try_codeword(shares, None, total)? {
            return Ok(Correction {
                shards,
                bad_piece_nums: Vec::new(),
            });
        }

        // leave-one-out: find the unique exclusion that restores consistency
        let mut located: Option<(u16, Vec<Vec<u8>>)> = None;
        for &(excluded, _) in shares {
            if shares.len() - 1 < required {
                break;
            }
            let Some(shards) = self.try_codeword(shares, Some(excluded), total)? else {
                continue;
            };
            let disagreeing: Vec<u16> = shares
                .iter()
                .filter(|(num, data)| shards[usize::from(*num)] != *data)
                .map(|(num, _)| *num)
                .collect();
            if disagreeing == [excluded] {
                if located.is_some() {
                    // more than one exclusion works: cannot pin the corruption
                    return Err(SchemeError::CorruptionUndetermined);
                }
                located = Some((excluded, shards));
            }
        }

        match located {
            Some((bad, shards)) => Ok(Correction {
                shards,
                bad_piece_nums: vec![bad],
            }),
            None => Err(SchemeError::CorruptionUndetermined),
        }
    }

    /// Reconstruct a full codeword from `shares` (optionally excluding one
    /// piece number) and return it iff it is parity-consistent.
    fn try_codeword(
        &self,
        shares: &[(u16, Vec<u8>)],
        exclude: Option<u16>,
        total: usize,
    ) -> Result<Option<Vec<Vec<u8>>>, SchemeError> {
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        for (num, data) in shares {
            if Some(*num) == exclude {
                continue;
            }
            shards[usize::from(*num)] = Some(data.clone());
        }

        if self.rs.reconstruct(&mut shards).is_err() {
            return Ok(None);
        }
        let shards: Vec<Vec<u8>> = shards.into_iter().flatten().collect();
        if shards.len() != total {
            return Ok(None);
        }

        let consistent = self.rs.verify(&shards).map_err(|e| SchemeError::Backend {
            message: e.to_string(),
        })?;
        Ok(consistent.then_some(shards))
    }

    fn check_shares(&self, shares: &[(u16, Vec<u8>)]) -> Result<(), SchemeError> {
        let total = self.redundancy.total;
        let mut seen = std::collections::HashSet::new();
        let mut len: Option<usize> = None;
        for (num, data) in shares {
            if *num >= total {
                return Err(SchemeError::MalformedShares {
                    message: format!("piece number {num} exceeds total {total}"),
                });
            }
            if !seen.insert(*num) {
                return Err(SchemeError::MalformedShares {
                    message: format!("duplicate share for piece {num}"),
                });
            }
            match len {
                Some(expected) if expected != data.len() => {
                    return Err(SchemeError::MalformedShares {
                        message: "shares have differing sizes".to_string(),
                    });
                }
                None => len = Some(data.len()),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> Scheme {
        Scheme::new(RedundancyScheme::new(2, 3, 4, 5, 8)).unwrap()
    }

    fn sample_data() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let scheme = scheme();
        let data = sample_data();
        let pieces = scheme.encode(&data).unwrap();
        assert_eq!(pieces.len(), 5);

        // drop pieces 0, 2, 4: any two suffice
        let shards = vec![
            None,
            Some(pieces[1].clone()),
            None,
            Some(pieces[3].clone()),
            None,
        ];
        let decoded = scheme.decode(shards, data.len() as u64).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_with_too_few_shards_fails() {
        let scheme = scheme();
        let pieces = scheme.encode(&sample_data()).unwrap();
        let shards = vec![Some(pieces[0].clone()), None, None, None, None];
        assert!(matches!(
            scheme.decode(shards, 32),
            Err(SchemeError::NotEnoughShares { got: 1, required: 2 })
        ));
    }

    #[test]
    fn unpadded_sizes_are_truncated() {
        let scheme = scheme();
        let data: Vec<u8> = (0u8..13).collect();
        let pieces = scheme.encode(&data).unwrap();
        let shards: Vec<Option<Vec<u8>>> = pieces.into_iter().map(Some).collect();
        let decoded = scheme.decode(shards, data.len() as u64).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn correct_passes_clean_shares() {
        let scheme = scheme();
        let pieces = scheme.encode(&sample_data()).unwrap();
        let shares: Vec<(u16, Vec<u8>)> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u16, p.clone()))
            .collect();

        let correction = scheme.correct(&shares).unwrap();
        assert!(correction.bad_piece_nums.is_empty());
        assert_eq!(correction.shards, pieces);
        assert_eq!(correction.data(2), sample_data());
    }

    #[test]
    fn correct_locates_single_corruption() {
        let scheme = scheme();
        let pieces = scheme.encode(&sample_data()).unwrap();

        // all five shares present, piece 3 tampered
        let mut shares: Vec<(u16, Vec<u8>)> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u16, p.clone()))
            .collect();
        shares[3].1 = vec![0xFF; shares[3].1.len()];

        let correction = scheme.correct(&shares).unwrap();
        assert_eq!(correction.bad_piece_nums, vec![3]);
        assert_eq!(correction.shards, pieces);
    }

    #[test]
    fn correct_detects_but_cannot_locate_at_k_plus_one() {
        let scheme = scheme();
        let pieces = scheme.encode(&sample_data()).unwrap();

        // only k + 1 = 3 shares, one of them corrupted
        let mut shares = vec![
            (0u16, pieces[0].clone()),
            (1u16, pieces[1].clone()),
            (2u16, pieces[2].clone()),
        ];
        shares[1].1 = vec![0xAA; shares[1].1.len()];

        assert!(matches!(
            scheme.correct(&shares),
            Err(SchemeError::CorruptionUndetermined)
        ));
    }

    #[test]
    fn correct_rejects_malformed_shares() {
        let scheme = scheme();
        let pieces = scheme.encode(&sample_data()).unwrap();

        let duplicate = vec![(0u16, pieces[0].clone()), (0u16, pieces[0].clone())];
        assert!(matches!(
            scheme.correct(&duplicate),
            Err(SchemeError::MalformedShares { .. })
        ));

        let out_of_range = vec![(7u16, pieces[0].clone())];
        assert!(matches!(
            scheme.correct(&out_of_range),
            Err(SchemeError::MalformedShares { .. })
        ));
    }

    #[test]
    fn schemes_without_parity_are_rejected() {
        assert!(matches!(
            Scheme::new(RedundancyScheme::new(2, 2, 2, 2, 8)),
            Err(SchemeError::InvalidScheme { .. })
        ));
    }

    #[test]
    fn stripe_slices_form_codewords() {
        // the property the audit path relies on: byte-aligned slices of the
        // pieces are themselves consistent codewords
        let scheme = Scheme::new(RedundancyScheme::new(2, 3, 4, 5, 4)).unwrap();
        let data: Vec<u8> = (0u8..64).collect();
        let pieces = scheme.encode(&data).unwrap();

        let share_size = 4usize;
        let stripe_index = 2usize;
        let shares: Vec<(u16, Vec<u8>)> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let start = stripe_index * share_size;
                (i as u16, p[start..start + share_size].to_vec())
            })
            .collect();

        let correction = scheme.correct(&shares).unwrap();
        assert!(correction.bad_piece_nums.is_empty());
    }
}
