//! PostgreSQL page checksum filter
//!
//! Validates data-file page checksums as the pages stream past during a
//! backup. The algorithm is PostgreSQL's block checksum: an FNV-1a
//! derivative computed over 32 parallel lanes, mixed with the block
//! number, reduced to 16 bits and biased so zero never appears.
//!
//! Pages whose LSN is at or beyond the backup start LSN are skipped: they
//! were written after the backup began and will be replayed from WAL
//! during recovery. All-zero pages are new and also valid.

use stanza_pack::{Pack, PackWrite, StringId};

use stanza_filter::{Filter, FilterType, Result};

/// Filter type of [`PageChecksumFilter`]
pub const PAGE_CHECKSUM_FILTER_TYPE: FilterType = StringId::new("page-chksum");

/// PostgreSQL page size
pub const PG_PAGE_SIZE_DEFAULT: usize = 8192;

/// Pages per relation segment (1 GiB segments)
pub const PG_SEGMENT_PAGE_DEFAULT: u64 = 131_072;

/// Lanes in the block checksum
const N_SUMS: usize = 32;

const FNV_PRIME: u32 = 16_777_619;

/// Initial lane values, fixed by the PostgreSQL on-disk format
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F_36E9, 0xB852_5960, 0x02AB_50AA, 0x1DE6_6D2A,
    0x79FF_467A, 0x9BB9_F8A3, 0x217E_7CD2, 0x83E1_3D2C,
    0xF8D4_474F, 0xE39E_B970, 0x42C6_AE16, 0x9932_16FA,
    0x7B09_3B5D, 0x98DA_FF3C, 0xF718_902A, 0x0B1C_9CDB,
    0xE58F_764B, 0x1876_36BC, 0x5D7B_3BB1, 0xE73D_E7DE,
    0x92BE_C979, 0xCCA6_C0B2, 0x304A_0979, 0x85AA_43D4,
    0x7831_25BB, 0x6CA8_EAA2, 0xE407_EAC6, 0x4B5C_FC3E,
    0x9FBF_8C76, 0x15CA_20BE, 0xF2CA_9FD3, 0x959B_D756,
];

const fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// Block checksum over a page whose pd_checksum field is zeroed.
fn checksum_block(page: &[u8]) -> u32 {
    let mut sums = CHECKSUM_BASE_OFFSETS;
    let words_per_row = N_SUMS;
    let rows = page.len() / (4 * words_per_row);

    for row in 0..rows {
        for lane in 0..N_SUMS {
            let at = (row * words_per_row + lane) * 4;
            let value = u32::from_le_bytes([
                page[at],
                page[at + 1],
                page[at + 2],
                page[at + 3],
            ]);

            sums[lane] = checksum_comp(sums[lane], value);
        }
    }

    // Two extra zero rounds to spread the last input bytes
    for _ in 0..2 {
        for sum in &mut sums {
            *sum = checksum_comp(*sum, 0);
        }
    }

    sums.iter().fold(0, |acc, sum| acc ^ sum)
}

/// Checksum of one page as PostgreSQL stores it in pd_checksum.
pub fn page_checksum(page: &[u8], block_no: u64) -> u16 {
    // Compute with pd_checksum (bytes 8..10) zeroed
    let mut copy = page.to_vec();
    copy[8] = 0;
    copy[9] = 0;

    let checksum = checksum_block(&copy) ^ (block_no as u32);
    ((checksum % 65535) + 1) as u16
}

fn page_lsn(page: &[u8]) -> u64 {
    let high = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
    let low = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
    (u64::from(high) << 32) | u64::from(low)
}

fn page_is_zero(page: &[u8]) -> bool {
    page.iter().all(|&byte| byte == 0)
}

/// Sink filter that verifies page checksums at segment boundaries.
///
/// The result pack carries `{valid, align, error[{page_no, lsn}]}` for the
/// backup orchestrator to record in the manifest.
pub struct PageChecksumFilter {
    page_size: usize,
    /// First page number of this segment
    page_no_first: u64,
    /// Pages at or beyond this LSN are skipped
    lsn_limit: u64,
    page: Vec<u8>,
    page_no: u64,
    valid: bool,
    align: bool,
    errors: Vec<(u64, u64)>,
}

impl PageChecksumFilter {
    pub fn new(segment_no: u64, segment_page: u64, page_size: usize, lsn_limit: u64) -> Self {
        Self {
            page_size,
            page_no_first: segment_no * segment_page,
            lsn_limit,
            page: Vec::with_capacity(page_size),
            page_no: 0,
            valid: true,
            align: true,
            errors: Vec::new(),
        }
    }

    fn page_verify(&mut self) {
        let page_no = self.page_no_first + self.page_no;

        if !page_is_zero(&self.page) {
            let lsn = page_lsn(&self.page);

            // Pages written after the backup started are replayed from WAL
            if lsn < self.lsn_limit {
                let stored = u16::from_le_bytes([self.page[8], self.page[9]]);
                let computed = page_checksum(&self.page, page_no);

                if stored != computed {
                    self.valid = false;
                    self.errors.push((page_no, lsn));
                }
            }
        }

        self.page_no += 1;
        self.page.clear();
    }
}

impl Filter for PageChecksumFilter {
    fn filter_type(&self) -> FilterType {
        PAGE_CHECKSUM_FILTER_TYPE
    }

    fn output(&self) -> bool {
        false
    }

    fn process_in(&mut self, input: &[u8]) -> Result<()> {
        let mut source = input;

        while !source.is_empty() {
            let need = self.page_size - self.page.len();
            let take = need.min(source.len());

            self.page.extend_from_slice(&source[..take]);
            source = &source[take..];

            if self.page.len() == self.page_size {
                self.page_verify();
            }
        }

        Ok(())
    }

    fn result(&mut self) -> Result<Option<Pack>> {
        // A trailing partial page means the file was not page aligned
        if !self.page.is_empty() {
            self.valid = false;
            self.align = false;
        }

        let mut pack = PackWrite::new();
        pack.write_bool_with(self.valid, stanza_pack::WriteParam::new().default_write())?;
        pack.write_bool_with(self.align, stanza_pack::WriteParam::new().default_write())?;
        pack.array_begin()?;

        for (page_no, lsn) in &self.errors {
            pack.obj_begin()?;
            pack.write_u64(*page_no)?;
            pack.write_u64(*lsn)?;
            pack.obj_end()?;
        }

        pack.array_end()?;
        Ok(Some(pack.end()?))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use stanza_pack::PackRead;

    fn make_page(block_no: u64, lsn: u64) -> Vec<u8> {
        let mut page = vec![0u8; PG_PAGE_SIZE_DEFAULT];

        // pd_lsn
        page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());

        // Some content so the page is not all zero
        page[100] = 0x42;
        page[8000] = 0x17;

        // Stamp a correct checksum
        let checksum = page_checksum(&page, block_no);
        page[8..10].copy_from_slice(&checksum.to_le_bytes());
        page
    }

    fn run_filter(filter: &mut PageChecksumFilter, data: &[u8]) -> (bool, bool, Vec<u64>) {
        filter.process_in(data).unwrap();
        let result = filter.result().unwrap().unwrap();

        let mut read = PackRead::new(&result);
        let valid = read.read_bool().unwrap();
        let align = read.read_bool().unwrap();

        let mut pages = Vec::new();
        read.array_begin().unwrap();
        while read.next().unwrap() {
            read.obj_begin().unwrap();
            pages.push(read.read_u64().unwrap());
            read.obj_end().unwrap();
        }
        read.array_end().unwrap();

        (valid, align, pages)
    }

    #[test]
    fn valid_pages_pass() {
        let mut data = make_page(0, 0x1000);
        data.extend(make_page(1, 0x2000));

        let mut filter = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let (valid, align, pages) = run_filter(&mut filter, &data);

        assert!(valid);
        assert!(align);
        assert!(pages.is_empty());
    }

    #[test]
    fn corrupt_page_is_reported() {
        let mut data = make_page(0, 0x1000);
        data.extend(make_page(1, 0x2000));
        data[4096] ^= 0xff; // corrupt page 0 past the header

        let mut filter = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let (valid, align, pages) = run_filter(&mut filter, &data);

        assert!(!valid);
        assert!(align);
        assert_eq!(pages, vec![0]);
    }

    #[test]
    fn zero_pages_are_new_and_valid() {
        let data = vec![0u8; PG_PAGE_SIZE_DEFAULT * 3];

        let mut filter = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let (valid, _, pages) = run_filter(&mut filter, &data);

        assert!(valid);
        assert!(pages.is_empty());
    }

    #[test]
    fn pages_past_the_lsn_limit_are_skipped() {
        let mut page = make_page(0, 0x9000);
        page[5000] ^= 0x01; // corrupt, but LSN is past the limit

        let mut filter = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, 0x8000);
        let (valid, _, pages) = run_filter(&mut filter, &page);

        assert!(valid);
        assert!(pages.is_empty());
    }

    #[test]
    fn segment_number_offsets_page_numbers() {
        let page = make_page(PG_SEGMENT_PAGE_DEFAULT, 0x1000);

        // Page 0 of segment 1 checks as page PG_SEGMENT_PAGE_DEFAULT
        let mut filter = PageChecksumFilter::new(1, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let (valid, _, _) = run_filter(&mut filter, &page);
        assert!(valid);
    }

    #[test]
    fn misaligned_input_fails() {
        let mut data = make_page(0, 0x1000);
        data.extend_from_slice(&[0u8; 100]);

        let mut filter = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let (valid, align, _) = run_filter(&mut filter, &data);

        assert!(!valid);
        assert!(!align);
    }

    #[test]
    fn split_feeds_match_single_feed() {
        let data = make_page(0, 0x1000);

        let mut whole = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        let whole_result = run_filter(&mut whole, &data);

        let mut split = PageChecksumFilter::new(0, PG_SEGMENT_PAGE_DEFAULT, PG_PAGE_SIZE_DEFAULT, u64::MAX);
        for chunk in data.chunks(777) {
            split.process_in(chunk).unwrap();
        }
        let result = split.result().unwrap().unwrap();
        let mut read = PackRead::new(&result);
        let valid = read.read_bool().unwrap();

        assert_eq!(valid, whole_result.0);
    }
}
