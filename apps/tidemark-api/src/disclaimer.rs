//! Per-state commercial financing disclosure notices.
//!
//! A handful of states require disclosure language on brokered commercial
//! financing documents. The matching notice travels back on the
//! `X-State-Disclaimer` response header; states without a mandate get no
//! header at all.

const CALIFORNIA: &str = "Disclaimer: CFL license required to broker loans. Disclosure must be signed by the recipient before the transaction is finalized - funding amount, finance charge, total repayment, prepayment policies, APR.";
const CONNECTICUT: &str = "Disclaimer: Providers and brokers must register with the state. For transactions <= $250,000 - must disclose total funding, cost of borrowing, repayment schedule, and broker compensation. APR is not required.";
const FLORIDA: &str = "Disclaimer: Providers must disclose terms for deals <= $500,000 - funding amount, finance charge, total repayment, prepayment policies, APR. Brokers must comply with code of conduct: no false advertising or upfront fees, address and phone number must be included in all advertising.";
const GEORGIA: &str = "Disclaimer: Providers and brokers must disclose terms for deals <= $500,000 - total funding amount, net funds disbursed, total repayment, total dollar cost, and payment schedule. APR is not required.";
const KANSAS: &str = "Disclaimer: Registration is not required. For transactions <= $500,000 - terms must be clearly disclosed before closing - total funds provided and disbursed, total repayment, cost of financing, payment frequency and schedule.";
const MISSOURI: &str = "Disclaimer: Brokers must be registered. For transactions <= $500,000 - provider must provide disclosure of terms - total funding amount, finance charge, total repayment, APR.";
const NEW_YORK: &str = "Disclaimer: Registration is not required for brokers or providers. For transactions <= $2.5 million, provider must provide disclosure including broker commission, total financing amount, amount disbursed, finance charge, APR.";
const UTAH: &str = "Disclaimer: For transactions <= $1 million, provider must maintain CFL license, register with state, and disclose broker commission, total amount funded, amount disbursed, total repayment, manner and frequency of payments. APR not required.";
const VIRGINIA: &str = "Disclaimer: Brokers and Providers must register. For transactions <= $500,000 - provider must disclose funding amount, payment method, finance charges, total repayment, any additional fees, APR not required. Dispute rules: lawsuits must be in VA, provider pays arbitration costs, must occur locally.";

/// Look up the disclosure for a state, by two-letter code or full name.
/// Matching ignores case and whitespace, so "New York" and "ny" both hit.
pub fn for_state(input: &str) -> Option<&'static str> {
    let normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    match normalized.as_str() {
        "ca" | "california" => Some(CALIFORNIA),
        "ct" | "connecticut" => Some(CONNECTICUT),
        "fl" | "florida" => Some(FLORIDA),
        "ga" | "georgia" => Some(GEORGIA),
        "ks" | "kansas" => Some(KANSAS),
        "mo" | "missouri" => Some(MISSOURI),
        "ny" | "newyork" => Some(NEW_YORK),
        "ut" | "utah" => Some(UTAH),
        "va" | "virginia" => Some(VIRGINIA),
        _ => None,
    }
}
