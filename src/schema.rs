/// Column-name constants for the sales ledger and its rollups.
/// Single source of truth - the ledger export and the report template both use these names.

// ── Identity columns ────────────────────────────────────────────────────────
pub mod identity {
    pub const COMPANY_CODE: &str = "法人コード";
    pub const COMPANY_NAME: &str = "法人名";
    pub const CUSTOMER_CODE: &str = "得意先コード";
    pub const CUSTOMER_NAME: &str = "得意先名";
    pub const OFFICE_NAME: &str = "営業所名";
    pub const SALES_REP: &str = "担当者名";
    pub const CATEGORY: &str = "第1階層";
    pub const PRODUCT_CODE: &str = "商品コード";
    pub const PRODUCT_NAME: &str = "商品名";

    /// Code columns that must stay text (leading zeros are significant).
    pub const CODES: [&str; 3] = [COMPANY_CODE, CUSTOMER_CODE, PRODUCT_CODE];
}

// ── Ledger export columns ───────────────────────────────────────────────────
pub mod ledger {
    use super::identity::*;

    pub const QUANTITY: &str = "売上数";
    pub const AREA: &str = "㎡";
    pub const REVENUE: &str = "売上金額";
    pub const GROSS_MARGIN: &str = "粗利金額";

    pub const METRICS: [&str; 4] = [QUANTITY, AREA, REVENUE, GROSS_MARGIN];

    pub const TEXT: [&str; 8] = [
        COMPANY_CODE,
        CUSTOMER_CODE,
        CUSTOMER_NAME,
        OFFICE_NAME,
        CATEGORY,
        PRODUCT_CODE,
        PRODUCT_NAME,
        SALES_REP,
    ];
}

// ── Master data columns ─────────────────────────────────────────────────────
pub mod master {
    pub use super::identity::{COMPANY_CODE, COMPANY_NAME};
}

// ── Metric suffixes (appended to a fiscal-year label) ───────────────────────
pub mod metric {
    pub const QUANTITY: &str = "売上数";
    pub const AREA: &str = "㎡";
    pub const REVENUE: &str = "売上";
    pub const GROSS_MARGIN: &str = "粗利";
}

// ── Legacy key aliases found in older historical vintages ───────────────────
pub mod legacy {
    pub const TRADING_PARTNER_CODE: &str = "取引先コード";
    pub const TRADING_PARTNER_NAME: &str = "取引先名";
    pub const CUSTOMER: &str = "得意先";
}

// ── Merge bookkeeping ───────────────────────────────────────────────────────
pub mod merge {
    /// Marker appended to historical data columns for the duration of a join.
    pub const SHADOW_SUFFIX: &str = "_past";
    pub const ORIGIN_ROW: &str = "__origin_row";
    pub const BACKFILL_CODE: &str = "__backfill_code";
    pub const MAPPING_COUNT: &str = "__mapping_count";
    pub const MAPPING_RANK: &str = "__mapping_rank";
    pub const LOOKUP_NAME: &str = "__lookup_name";
    pub const MASTER_NAME: &str = "__master_name";
    pub const OFFICE_RANK: &str = "__office_rank";
    pub const KEY_COUNT: &str = "__key_count";
}

// ── Report files ────────────────────────────────────────────────────────────
pub mod report {
    pub const TITLE: &str = "ランキング（得意先）";
    pub const DEFAULT_TERM: &str = "年度";
    pub const DEFAULT_OFFICE_ORDER: [&str; 6] = ["札幌", "仙台", "東京", "大阪", "名古屋", "福岡"];
}
