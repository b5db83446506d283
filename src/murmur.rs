//! MurmurHash3 x86 128-bit, used as the sharding bucket hash

const C1: u32 = 0x239b_961b;
const C2: u32 = 0xab0e_9789;
const C3: u32 = 0x38b3_4ae5;
const C4: u32 = 0xa1e3_8b93;

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[inline]
fn mix_k1(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn mix_k2(k: u32) -> u32 {
    k.wrapping_mul(C2).rotate_left(16).wrapping_mul(C3)
}

#[inline]
fn mix_k3(k: u32) -> u32 {
    k.wrapping_mul(C3).rotate_left(17).wrapping_mul(C4)
}

#[inline]
fn mix_k4(k: u32) -> u32 {
    k.wrapping_mul(C4).rotate_left(18).wrapping_mul(C1)
}

/// Full 128-bit digest as four 32-bit lanes `[h1, h2, h3, h4]`
pub fn murmurhash3_x86_128(data: &[u8], seed: u32) -> [u32; 4] {
    let mut h1 = seed;
    let mut h2 = seed;
    let mut h3 = seed;
    let mut h4 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let k2 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        let k3 = u32::from_le_bytes([block[8], block[9], block[10], block[11]]);
        let k4 = u32::from_le_bytes([block[12], block[13], block[14], block[15]]);

        h1 ^= mix_k1(k1);
        h1 = h1
            .rotate_left(19)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x561c_cd1b);

        h2 ^= mix_k2(k2);
        h2 = h2
            .rotate_left(17)
            .wrapping_add(h3)
            .wrapping_mul(5)
            .wrapping_add(0x0bca_a747);

        h3 ^= mix_k3(k3);
        h3 = h3
            .rotate_left(15)
            .wrapping_add(h4)
            .wrapping_mul(5)
            .wrapping_add(0x96cd_1c35);

        h4 ^= mix_k4(k4);
        h4 = h4
            .rotate_left(13)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x32ac_3b17);
    }

    // Tail lanes left at zero mix to zero, so all four can be applied
    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = [0u32; 4];
        for (i, &byte) in tail.iter().enumerate() {
            k[i / 4] ^= (byte as u32) << (8 * (i % 4));
        }
        h1 ^= mix_k1(k[0]);
        h2 ^= mix_k2(k[1]);
        h3 ^= mix_k3(k[2]);
        h4 ^= mix_k4(k[3]);
    }

    let len = data.len() as u32;
    h1 ^= len;
    h2 ^= len;
    h3 ^= len;
    h4 ^= len;

    h1 = h1.wrapping_add(h2).wrapping_add(h3).wrapping_add(h4);
    h2 = h2.wrapping_add(h1);
    h3 = h3.wrapping_add(h1);
    h4 = h4.wrapping_add(h1);

    h1 = fmix32(h1);
    h2 = fmix32(h2);
    h3 = fmix32(h3);
    h4 = fmix32(h4);

    h1 = h1.wrapping_add(h2).wrapping_add(h3).wrapping_add(h4);
    h2 = h2.wrapping_add(h1);
    h3 = h3.wrapping_add(h1);
    h4 = h4.wrapping_add(h1);

    [h1, h2, h3, h4]
}

/// Low 64 bits of the digest of `value`'s little-endian bytes, seed 0
pub fn murmurhash3_x86_128_u64(value: u64) -> u64 {
    let [h1, h2, _, _] = murmurhash3_x86_128(&value.to_le_bytes(), 0);
    (h1 as u64) | ((h2 as u64) << 32)
}
