use latch_paging::TierKind;

/// Directive for how many pages of a request should come from a tier.
///
/// Tokens are walked in order by `TransientAllocator::acquire`. Whatever the
/// tokens leave unplaced, including fast pages that did not fit, goes to the
/// main tier.
///
/// Format when packed: [1-bit fast flag | 31-bit page count]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TierToken {
    pub tier: TierKind,
    pub pages: u32,
}

impl TierToken {
    const FAST_BIT: u32 = 1 << 31;

    /// Page count meaning "as many of the remaining pages as the tier holds".
    pub const ALL_REMAINING: u32 = u32::MAX >> 1;

    pub const fn fast(pages: u32) -> Self {
        Self {
            tier: TierKind::Fast,
            pages: pages & Self::ALL_REMAINING,
        }
    }

    pub const fn main(pages: u32) -> Self {
        Self {
            tier: TierKind::Main,
            pages: pages & Self::ALL_REMAINING,
        }
    }

    pub const fn fast_remaining() -> Self {
        Self::fast(Self::ALL_REMAINING)
    }

    pub const fn main_remaining() -> Self {
        Self::main(Self::ALL_REMAINING)
    }

    /// Pages this token asks for out of `outstanding` still unplaced.
    #[inline]
    pub fn pages_of(&self, outstanding: u32) -> u32 {
        self.pages.min(outstanding)
    }

    pub fn to_bits(&self) -> u32 {
        match self.tier {
            TierKind::Fast => Self::FAST_BIT | self.pages,
            TierKind::Main => self.pages,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        let pages = bits & Self::ALL_REMAINING;
        if bits & Self::FAST_BIT != 0 {
            Self::fast(pages)
        } else {
            Self::main(pages)
        }
    }
}
