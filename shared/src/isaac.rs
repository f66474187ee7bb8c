//! ISAAC keystream used to obfuscate packet opcodes.
//!
//! Both ends seed a generator from the same four words at login and then
//! draw one value per packet. The transform is not a security boundary; it
//! only requires that the two streams stay in lock step.

const SIZE: usize = 256;
const GOLDEN_RATIO: u32 = 0x9e37_79b9;

/// Offset the server adds to each seed word for its outbound stream.
pub const OUTBOUND_SEED_OFFSET: u32 = 50;

#[derive(Clone)]
pub struct IsaacCipher {
    count: usize,
    results: [u32; SIZE],
    memory: [u32; SIZE],
    a: u32,
    b: u32,
    c: u32,
}

impl std::fmt::Debug for IsaacCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsaacCipher")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl IsaacCipher {
    pub fn new(seed: &[u32]) -> Self {
        let mut cipher = Self {
            count: 0,
            results: [0; SIZE],
            memory: [0; SIZE],
            a: 0,
            b: 0,
            c: 0,
        };
        let len = seed.len().min(SIZE);
        cipher.results[..len].copy_from_slice(&seed[..len]);
        cipher.init();
        cipher
    }

    /// The stream a server sends with, given the seed the client logged in with.
    pub fn outbound(seed: &[u32; 4]) -> Self {
        Self::new(&seed.map(|word| word.wrapping_add(OUTBOUND_SEED_OFFSET)))
    }

    pub fn next_value(&mut self) -> u32 {
        if self.count == 0 {
            self.isaac();
            self.count = SIZE;
        }
        self.count -= 1;
        self.results[self.count]
    }

    /// Low byte of the next value, the amount an opcode is shifted by.
    pub fn next_byte(&mut self) -> u8 {
        self.next_value() as u8
    }

    fn isaac(&mut self) {
        self.c = self.c.wrapping_add(1);
        self.b = self.b.wrapping_add(self.c);
        for i in 0..SIZE {
            let x = self.memory[i];
            self.a ^= match i & 3 {
                0 => self.a << 13,
                1 => self.a >> 6,
                2 => self.a << 2,
                _ => self.a >> 16,
            };
            self.a = self.a.wrapping_add(self.memory[(i + SIZE / 2) & (SIZE - 1)]);
            let y = self.memory[(x >> 2) as usize & (SIZE - 1)]
                .wrapping_add(self.a)
                .wrapping_add(self.b);
            self.memory[i] = y;
            self.b = self.memory[(y >> 10) as usize & (SIZE - 1)].wrapping_add(x);
            self.results[i] = self.b;
        }
    }

    fn init(&mut self) {
        let mut s = [GOLDEN_RATIO; 8];
        for _ in 0..4 {
            mix(&mut s);
        }
        for i in (0..SIZE).step_by(8) {
            for (k, word) in s.iter_mut().enumerate() {
                *word = word.wrapping_add(self.results[i + k]);
            }
            mix(&mut s);
            self.memory[i..i + 8].copy_from_slice(&s);
        }
        for i in (0..SIZE).step_by(8) {
            for (k, word) in s.iter_mut().enumerate() {
                *word = word.wrapping_add(self.memory[i + k]);
            }
            mix(&mut s);
            self.memory[i..i + 8].copy_from_slice(&s);
        }
        self.isaac();
        self.count = SIZE;
    }
}

fn mix(s: &mut [u32; 8]) {
    s[0] ^= s[1] << 11;
    s[3] = s[3].wrapping_add(s[0]);
    s[1] = s[1].wrapping_add(s[2]);
    s[1] ^= s[2] >> 2;
    s[4] = s[4].wrapping_add(s[1]);
    s[2] = s[2].wrapping_add(s[3]);
    s[2] ^= s[3] << 8;
    s[5] = s[5].wrapping_add(s[2]);
    s[3] = s[3].wrapping_add(s[4]);
    s[3] ^= s[4] >> 16;
    s[6] = s[6].wrapping_add(s[3]);
    s[4] = s[4].wrapping_add(s[5]);
    s[4] ^= s[5] << 10;
    s[7] = s[7].wrapping_add(s[4]);
    s[5] = s[5].wrapping_add(s[6]);
    s[5] ^= s[6] >> 4;
    s[0] = s[0].wrapping_add(s[5]);
    s[6] = s[6].wrapping_add(s[7]);
    s[6] ^= s[7] << 8;
    s[1] = s[1].wrapping_add(s[6]);
    s[7] = s[7].wrapping_add(s[0]);
    s[7] ^= s[0] >> 9;
    s[2] = s[2].wrapping_add(s[7]);
    s[0] = s[0].wrapping_add(s[1]);
}
