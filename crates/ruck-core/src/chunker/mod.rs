pub mod polynomial;

use std::io::Read;

use ruck_types::Result;

pub use polynomial::Polynomial;

/// Minimum chunk size. Boundaries are never declared before this many bytes.
pub const MIN_SIZE: usize = 512 * 1024;

/// Maximum chunk size. A boundary is forced when a chunk reaches this size.
pub const MAX_SIZE: usize = 8 * 1024 * 1024;

/// Nominal target chunk size.
pub const AVG_SIZE: usize = 1024 * 1024;

/// Rolling hash window in bytes.
const WINDOW_SIZE: usize = 64;

/// A boundary is declared when `fingerprint & SPLITMASK == 0`; the mask is
/// sized so boundaries occur once per `AVG_SIZE` bytes on average.
const SPLITMASK: u64 = (AVG_SIZE as u64) - 1;

/// Read-buffer size for pulling bytes from the underlying reader.
const BUF_SIZE: usize = 512 * 1024;

/// One content-defined chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub length: usize,
    /// Rolling fingerprint at the cut point.
    pub fingerprint: u64,
}

/// Precomputed lookup tables for one polynomial.
///
/// `out` cancels the contribution of the byte sliding out of the window;
/// `modt` folds the top byte of the fingerprint back below the polynomial
/// degree after each append.
struct Tables {
    out: [u64; 256],
    modt: [u64; 256],
}

fn append_byte(hash: u64, b: u8, pol: Polynomial) -> u64 {
    let shifted = Polynomial((hash << 8) | b as u64);
    shifted_rem(shifted, pol)
}

fn shifted_rem(p: Polynomial, m: Polynomial) -> u64 {
    let dm = m.deg();
    let mut res = p.0;
    loop {
        let dr = Polynomial(res).deg();
        if dr < dm {
            return res;
        }
        res ^= m.0 << (dr - dm);
    }
}

impl Tables {
    fn new(pol: Polynomial) -> Tables {
        let k = pol.deg();
        let mut out = [0u64; 256];
        let mut modt = [0u64; 256];

        for b in 0..256usize {
            // Hash of a window that starts with byte b followed by zeros:
            // exactly what must be XORed out when b leaves the window.
            let mut h = append_byte(0, b as u8, pol);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, pol);
            }
            out[b] = h;

            // Reduction of (b << k), with the original top bits included so
            // a single XOR both clears them and adds the remainder.
            let top = (b as u64) << k;
            modt[b] = shifted_rem(Polynomial(top), pol) | top;
        }

        Tables { out, modt }
    }
}

/// Content-defined chunker: splits a byte stream into variable-sized chunks
/// using a 64-bit rolling Rabin fingerprint over a fixed window.
///
/// Chunking a given byte sequence with a given polynomial yields identical
/// boundaries across runs and implementations; the archiver relies on this
/// for deduplication.
pub struct Chunker<R> {
    rd: R,
    tables: Tables,
    pol_shift: u32,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,

    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(rd: R, pol: Polynomial) -> Self {
        assert!(pol.deg() > 8, "chunking polynomial degree must exceed 8");
        Chunker {
            rd,
            tables: Tables::new(pol),
            pol_shift: (pol.deg() - 8) as u32,
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            buf: vec![0u8; BUF_SIZE],
            buf_pos: 0,
            buf_len: 0,
            eof: false,
        }
    }

    fn reset_window(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        // Seed with a one bit so a window of zero bytes has a non-zero
        // state; the seed leaves the window before the minimum size.
        self.slide(1);
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;
        self.digest ^= self.tables.out[out as usize];

        let index = (self.digest >> self.pol_shift) as usize;
        self.digest <<= 8;
        self.digest |= b as u64;
        self.digest ^= self.tables.modt[index];
    }

    /// Pull the next byte from the buffered reader; `None` at end of input.
    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.buf_pos == self.buf_len {
            if self.eof {
                return Ok(None);
            }
            let n = self.rd.read(&mut self.buf)?;
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.buf_pos = 0;
            self.buf_len = n;
        }
        let b = self.buf[self.buf_pos];
        self.buf_pos += 1;
        Ok(Some(b))
    }

    /// Produce the next chunk, or `None` when the input is exhausted.
    ///
    /// Boundary rule: at least `MIN_SIZE` bytes, then cut when
    /// `fingerprint & SPLITMASK == 0`, or unconditionally at `MAX_SIZE`.
    /// The final chunk may be shorter than the minimum.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.reset_window();
        let mut data: Vec<u8> = Vec::with_capacity(MIN_SIZE);

        loop {
            let b = match self.next_byte()? {
                Some(b) => b,
                None => break,
            };
            data.push(b);
            self.slide(b);

            if data.len() >= MIN_SIZE && self.digest & SPLITMASK == 0 {
                break;
            }
            if data.len() == MAX_SIZE {
                break;
            }
        }

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Chunk {
            length: data.len(),
            fingerprint: self.digest,
            data,
        }))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
