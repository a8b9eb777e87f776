//! Courier status code/text → canonical status mapping.

use std::collections::HashMap;

use courier_core::CanonicalStatus;

/// Returned for anything the table does not recognise. A dispatched order is
/// never moved back to a pre-dispatch status by an unknown code.
pub const SAFE_DEFAULT: CanonicalStatus = CanonicalStatus::InDelivery;

#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub code: i64,
    pub texts: &'static [&'static str],
    pub status: CanonicalStatus,
}

pub const WASEET_STATUS_TABLE: &[StatusEntry] = &[
    StatusEntry { code: 1, texts: &["active", "فعال"], status: CanonicalStatus::Active },
    StatusEntry {
        code: 2,
        texts: &["received by courier", "تم الاستلام من قبل المندوب"],
        status: CanonicalStatus::InDelivery,
    },
    StatusEntry {
        code: 3,
        texts: &[
            "out for delivery",
            "قيد التوصيل الى الزبون (في عهدة المندوب)",
            "قيد التوصيل",
        ],
        status: CanonicalStatus::InDelivery,
    },
    StatusEntry {
        code: 4,
        texts: &["delivered", "تم التسليم للزبون"],
        status: CanonicalStatus::Delivered,
    },
    StatusEntry { code: 5, texts: &["at governorate sorting"], status: CanonicalStatus::InDelivery },
    StatusEntry { code: 6, texts: &["at office"], status: CanonicalStatus::InDelivery },
    StatusEntry {
        code: 7,
        texts: &["on the way to governorate office"],
        status: CanonicalStatus::InDelivery,
    },
    StatusEntry {
        code: 17,
        texts: &["returned to merchant", "تم الارجاع الى التاجر"],
        status: CanonicalStatus::ReturnedToMerchant,
    },
    StatusEntry { code: 18, texts: &["governorate changed"], status: CanonicalStatus::AddressChanged },
    StatusEntry {
        code: 23,
        texts: &["sent to returns warehouse", "ارسال الى مخزن الارجاعات"],
        status: CanonicalStatus::Returned,
    },
    StatusEntry { code: 25, texts: &["no answer", "لا يرد"], status: CanonicalStatus::NoAnswer },
    StatusEntry {
        code: 26,
        texts: &["no answer after agreement", "لا يرد بعد الاتفاق"],
        status: CanonicalStatus::NoAnswer,
    },
    StatusEntry { code: 27, texts: &["phone closed", "مغلق"], status: CanonicalStatus::PhoneClosed },
    StatusEntry {
        code: 28,
        texts: &["phone closed after agreement", "مغلق بعد الاتفاق"],
        status: CanonicalStatus::PhoneClosed,
    },
    StatusEntry { code: 29, texts: &["postponed", "مؤجل"], status: CanonicalStatus::Postponed },
    StatusEntry {
        code: 30,
        texts: &["postponed until reordered", "مؤجل لحين اعادة الطلب لاحقا"],
        status: CanonicalStatus::Postponed,
    },
    StatusEntry {
        code: 31,
        texts: &["order cancelled", "الغاء الطلب"],
        status: CanonicalStatus::Cancelled,
    },
    StatusEntry { code: 32, texts: &["order rejected", "رفض الطلب"], status: CanonicalStatus::Rejected },
    StatusEntry { code: 33, texts: &["out of service"], status: CanonicalStatus::OutOfService },
    StatusEntry { code: 34, texts: &["duplicate order"], status: CanonicalStatus::DuplicateOrder },
    StatusEntry { code: 35, texts: &["already received"], status: CanonicalStatus::Delivered },
    StatusEntry {
        code: 36,
        texts: &["number not recognised"],
        status: CanonicalStatus::NumberUnreachable,
    },
    StatusEntry {
        code: 37,
        texts: &["number not in service"],
        status: CanonicalStatus::NumberUnreachable,
    },
    StatusEntry { code: 38, texts: &["inaccurate address"], status: CanonicalStatus::WrongAddress },
    StatusEntry { code: 39, texts: &["not ordered"], status: CanonicalStatus::NotOrdered },
    StatusEntry { code: 40, texts: &["courier blocked"], status: CanonicalStatus::InDelivery },
    StatusEntry {
        code: 41,
        texts: &["number unreachable"],
        status: CanonicalStatus::NumberUnreachable,
    },
    StatusEntry { code: 42, texts: &["courier changed"], status: CanonicalStatus::InDelivery },
];

/// Pure lookup from courier status code and text to the canonical vocabulary.
#[derive(Debug, Clone)]
pub struct StatusMapper {
    by_code: HashMap<i64, StatusEntry>,
    by_text: HashMap<String, CanonicalStatus>,
    overrides: HashMap<i64, CanonicalStatus>,
}

impl Default for StatusMapper {
    fn default() -> Self {
        Self::new(WASEET_STATUS_TABLE)
    }
}

impl StatusMapper {
    pub fn new(table: &[StatusEntry]) -> Self {
        let mut by_code = HashMap::with_capacity(table.len());
        let mut by_text = HashMap::new();
        for entry in table {
            by_code.insert(entry.code, *entry);
            for text in entry.texts {
                by_text.entry(normalize_text(text)).or_insert(entry.status);
            }
        }
        Self {
            by_code,
            by_text,
            overrides: HashMap::new(),
        }
    }

    /// Replaces the canonical status for specific codes without touching the table.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (i64, CanonicalStatus)>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn map(&self, code: i64, text: &str) -> CanonicalStatus {
        if let Some(status) = self.overrides.get(&code) {
            return *status;
        }
        if let Some(entry) = self.by_code.get(&code) {
            return entry.status;
        }
        self.by_text
            .get(&normalize_text(text))
            .copied()
            .filter(|status| !status.is_pre_dispatch())
            .unwrap_or(SAFE_DEFAULT)
    }

    pub fn is_known_code(&self, code: i64) -> bool {
        self.by_code.contains_key(&code) || self.overrides.contains_key(&code)
    }

    /// Only allow-listed codes are written to the store's code column.
    pub fn persisted_code(&self, code: i64) -> Option<i64> {
        self.is_known_code(code).then_some(code)
    }

    pub fn reference_text(&self, code: i64) -> Option<&'static str> {
        self.by_code.get(&code).and_then(|e| e.texts.first().copied())
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
