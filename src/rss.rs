//! Receive-side queue steering: Jenkins 32-bit hash over a per-flow word
//! vector, reduced to one of the guest's active receive queues (§4.3).

/// Seed used for wire compatibility with existing RSS distributions.
pub const RSS_SEED: u32 = 0xdeadbee5;

#[inline]
fn rot(x: u32, k: u32) -> u32 {
    (x << k) | (x >> (32 - k))
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= rot(*c, 4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rot(*a, 6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rot(*b, 8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= rot(*c, 16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rot(*a, 19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rot(*b, 4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 14));
    *a ^= *c;
    *a = a.wrapping_sub(rot(*c, 11));
    *b ^= *a;
    *b = b.wrapping_sub(rot(*a, 25));
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 16));
    *a ^= *c;
    *a = a.wrapping_sub(rot(*c, 4));
    *b ^= *a;
    *b = b.wrapping_sub(rot(*a, 14));
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 24));
}

/// Jenkins one-at-a-time lookup3 `hashword` over a slice of 32-bit words.
/// Equivalent to `rte_jhash_32b(words, words.len(), initval)`.
pub fn jhash_words(words: &[u32], initval: u32) -> u32 {
    let mut a: u32 = 0xdeadbeefu32
        .wrapping_add((words.len() as u32) << 2)
        .wrapping_add(initval);
    let mut b = a;
    let mut c = a;

    let mut chunks = words.chunks_exact(3);
    for chunk in &mut chunks {
        a = a.wrapping_add(chunk[0]);
        b = b.wrapping_add(chunk[1]);
        c = c.wrapping_add(chunk[2]);
        mix(&mut a, &mut b, &mut c);
    }

    let rem = chunks.remainder();
    match rem.len() {
        2 => {
            b = b.wrapping_add(rem[1]);
            a = a.wrapping_add(rem[0]);
            finalize(&mut a, &mut b, &mut c);
        }
        1 => {
            a = a.wrapping_add(rem[0]);
            finalize(&mut a, &mut b, &mut c);
        }
        _ => {}
    }

    c
}

/// Word vector built from a parsed packet, per §4.3's ethertype dispatch.
pub enum FlowKey<'a> {
    Ipv4 {
        src_ip: u32,
        dst_ip: u32,
        proto: u8,
        /// `(dst_port << 16) | src_port`, present for TCP/UDP/SCTP only.
        ports: Option<u32>,
    },
    Ipv6 {
        src_addr: [u32; 4],
        dst_addr: [u32; 4],
        next_header: u8,
    },
    Other {
        l2_prefix: &'a [u8],
        ethertype: u16,
    },
}

impl FlowKey<'_> {
    fn to_words(&self) -> Vec<u32> {
        match self {
            FlowKey::Ipv4 {
                src_ip,
                dst_ip,
                proto,
                ports,
            } => {
                let mut v = vec![*src_ip, *dst_ip, *proto as u32];
                if let Some(p) = ports {
                    v.push(*p);
                }
                v
            }
            FlowKey::Ipv6 {
                src_addr,
                dst_addr,
                next_header,
            } => {
                let mut v = Vec::with_capacity(9);
                v.extend_from_slice(src_addr);
                v.extend_from_slice(dst_addr);
                v.push(*next_header as u32);
                v
            }
            FlowKey::Other {
                l2_prefix,
                ethertype,
            } => {
                let mut buf = [0u8; 12];
                let n = l2_prefix.len().min(12);
                buf[..n].copy_from_slice(&l2_prefix[..n]);
                let mut v = Vec::with_capacity(4);
                for chunk in buf.chunks_exact(4) {
                    v.push(u32::from_ne_bytes(chunk.try_into().unwrap()));
                }
                v.push(*ethertype as u32);
                v
            }
        }
    }
}

/// Hash a flow key to a 32-bit digest using the RSS seed.
pub fn hash_flow(key: &FlowKey) -> u32 {
    let words = key.to_words();
    jhash_words(&words, RSS_SEED)
}

/// Reduce a hash to a receive-queue slot index in `[0, rx_q_active)`.
pub fn reduce(hash: u32, rx_q_active: u32, pow2_queues: bool) -> u32 {
    debug_assert!(rx_q_active > 0);
    if pow2_queues {
        hash & (rx_q_active - 1)
    } else {
        hash % rx_q_active
    }
}
