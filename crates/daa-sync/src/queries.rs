//! Remote read queries. All placeholders are positional `?`.

use daa_core::ColumnPresence;

/// Params: paid status, cutoff.
pub const ORDERS: &str = "SELECT id AS order_int_id, order_id, uid, subscribe_id, product_id,
       status AS order_status, description, pay_time,
       amount, currency, transaction_fee, is_sub, pay_type
FROM `order`
WHERE status = ? AND pay_time >= ?";

/// Subscriptions created at/after the cutoff plus every one referenced by a retained order.
/// Absent tenant columns are selected as placeholders so all brands share one column set.
///
/// Params: cutoff, paid status, cutoff.
pub fn subscriptions(columns: ColumnPresence) -> String {
    let owner = if columns.subscription_owner { "uid" } else { "''" };
    let device_support = if columns.device_support {
        "support_dev_num"
    } else {
        "0"
    };
    let cloud_tier = if columns.cloud_tier { "cloud_type" } else { "0" };
    format!(
        "SELECT subscribe_id, {owner} AS sub_uid, product_id AS sub_product_id,
       amount AS sub_amount, currency AS sub_currency,
       cycles_unit, cycles_time, status AS sub_status,
       create_time AS sub_create_time, cancel_time AS sub_cancel_time,
       {device_support} AS support_dev_num, {cloud_tier} AS cloud_type
FROM subscribe
WHERE create_time >= ? OR subscribe_id IN (
    SELECT DISTINCT subscribe_id FROM `order`
    WHERE status = ? AND pay_time >= ? AND subscribe_id IS NOT NULL
)"
    )
}

pub const SET_MEAL: &str = "SELECT code, name, time, file_time, price, saleprice, status,
       time_unit, currency, level
FROM set_meal";

/// Params: paid status, cutoff.
pub const AMOUNT_DETAIL: &str = "SELECT oai.order_int_id, oai.model_code, oai.amount_cny,
       oai.transaction_fee_cny, oai.exchange_rate
FROM order_amount_info oai
INNER JOIN `order` o ON oai.order_int_id = o.id
WHERE o.status = ? AND o.pay_time >= ?";

/// Joined on the business order id, not the numeric one.
///
/// Params: paid status, cutoff.
pub const CLOUD_RECORDS: &str = "SELECT ci.id AS cloud_id, ci.uid AS cloud_uid, ci.uuid AS cloud_uuid,
       ci.order_id, ci.start_time AS cloud_start_time,
       ci.end_time AS cloud_end_time, ci.file_time,
       ci.status AS cloud_status, ci.is_delete, ci.level
FROM cloud_info ci
INNER JOIN `order` o ON ci.order_id = o.order_id
WHERE o.status = ? AND o.pay_time >= ?";

/// `online_time` is epoch milliseconds; `create_time` is epoch seconds.
///
/// Params: liveness threshold (ms), cutoff.
pub const DEVICE_COUNTS: &str = "SELECT COUNT(DISTINCT uuid) AS total_devices,
       COUNT(DISTINCT CASE
           WHEN mq_online = 1 OR p2p_online = 1 OR online_time > ? THEN uuid
       END) AS active_devices_30d
FROM device
WHERE create_time >= ?";

/// Params: now (epoch seconds).
pub const COVERED_DEVICES: &str = "SELECT COUNT(DISTINCT ci.uuid) AS devices_with_subscription
FROM cloud_info ci
WHERE ci.end_time > ?
  AND ci.uuid IS NOT NULL AND ci.uuid != ''
  AND ci.is_delete = 0";

/// Full history, no cutoff. Params: paid status.
pub const FIRST_PAYMENT: &str = "SELECT subscribe_id, MIN(pay_time) AS first_pay_time
FROM `order`
WHERE status = ? AND amount > 0 AND subscribe_id IS NOT NULL AND subscribe_id != ''
GROUP BY subscribe_id
ORDER BY subscribe_id";
