//! Minimal Bloom filter for gossip dedup. No deletions; the gossip manager
//! rebuilds it from scratch whenever its companion timestamp map empties,
//! per the design note on Bloom filters without deletions.

pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let num_bits = optimal_num_bits(expected_items, false_positive_rate);
        let num_hashes = optimal_num_hashes(num_bits, expected_items);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes: num_hashes.max(1),
        }
    }

    fn indices(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h1 = u64::from_le_bytes(blake3::hash(item).as_bytes()[0..8].try_into().unwrap());
        let mut salted = Vec::with_capacity(item.len() + 1);
        salted.extend_from_slice(item);
        salted.push(0xA5);
        let h2 = u64::from_le_bytes(blake3::hash(&salted).as_bytes()[0..8].try_into().unwrap());
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % self.num_bits as u64) as usize
        })
    }

    pub fn insert(&mut self, item: &[u8]) {
        for idx in self.indices(item).collect::<Vec<_>>() {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.indices(item)
            .all(|idx| self.bits[idx / 64] & (1 << (idx % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }
}

fn optimal_num_bits(n: usize, p: f64) -> usize {
    let m = -(n as f64) * p.ln() / (std::f64::consts::LN_2.powi(2));
    (m.ceil() as usize).max(64)
}

fn optimal_num_hashes(num_bits: usize, n: usize) -> u32 {
    let k = (num_bits as f64 / n as f64) * std::f64::consts::LN_2;
    (k.round() as u32).clamp(1, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_items_are_found() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        filter.insert(b"hello");
        filter.insert(b"world");
        assert!(filter.contains(b"hello"));
        assert!(filter.contains(b"world"));
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(format!("item-{i}").as_bytes());
        }
        let mut false_positives = 0;
        for i in 1_000..2_000 {
            if filter.contains(format!("item-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Generous bound, well above the configured 1% target, to avoid a
        // flaky test while still catching a broken hash/sizing scheme.
        assert!(false_positives < 100, "false positives: {false_positives}");
    }

    #[test]
    fn clear_resets_membership() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.insert(b"x");
        filter.clear();
        assert!(!filter.contains(b"x"));
    }
}
