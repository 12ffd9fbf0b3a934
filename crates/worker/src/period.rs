//! 周期计划的追赶推进。
//!
//! 节点可能停机很久，next_start落后当前时刻任意多个周期。推进时步长
//! 先翻倍爬升再逐级回退，错过k个周期只需O(log k)次日期运算，而不是
//! 逐周期累加。

use chrono::{DateTime, Duration, Months, Utc};

use longtask_core::PeriodUnit;

/// `t + units×unit`，溢出或单位非法时返回None。
pub fn add_periods(t: DateTime<Utc>, unit: PeriodUnit, units: i64) -> Option<DateTime<Utc>> {
    if units <= 0 {
        return None;
    }
    match unit {
        PeriodUnit::Seconds => t.checked_add_signed(Duration::seconds(units)),
        PeriodUnit::Minutes => t.checked_add_signed(Duration::minutes(units)),
        PeriodUnit::Hours => t.checked_add_signed(Duration::hours(units)),
        PeriodUnit::Days => t.checked_add_signed(Duration::days(units)),
        PeriodUnit::Weeks => t.checked_add_signed(Duration::weeks(units)),
        PeriodUnit::Months => u32::try_from(units)
            .ok()
            .and_then(|m| t.checked_add_months(Months::new(m))),
    }
}

/// 从start按整周期前进到不超过until的最远时刻，返回(时刻, 运算次数)。
///
/// 不变式：返回值再加一个周期必然越过until。
pub fn advance_until(
    start: DateTime<Utc>,
    until: DateTime<Utc>,
    unit: PeriodUnit,
    count: i32,
) -> Option<(DateTime<Utc>, u32)> {
    if count <= 0 {
        return None;
    }
    let count = count as i64;
    let mut cur = start;
    let mut steps: u32 = 0;

    // 爬升：步长2^(L+1)×count，直到越过until
    let mut levels: u32 = 0;
    while levels < 62 {
        let Some(units) = count.checked_mul(1i64 << (levels + 1)) else {
            break;
        };
        steps += 1;
        match add_periods(cur, unit, units) {
            Some(t) if t <= until => {
                cur = t;
                levels += 1;
            }
            _ => break,
        }
    }

    // 回退：逐级尝试补上2^d×count
    for d in (0..levels).rev() {
        let units = count << d;
        steps += 1;
        if let Some(t) = add_periods(cur, unit, units) {
            if t <= until {
                cur = t;
            }
        }
    }

    // 爬升从2×count起步，可能留下最后一个单周期
    if let Some(t) = add_periods(cur, unit, count) {
        steps += 1;
        if t <= until {
            cur = t;
        }
    }

    Some((cur, steps))
}

/// 下一次应当启动的时刻：严格大于now的最小occurrence。
pub fn next_occurrence(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    unit: PeriodUnit,
    count: i32,
) -> Option<DateTime<Utc>> {
    if start > now {
        return Some(start);
    }
    let (reached, _) = advance_until(start, now, unit, count)?;
    add_periods(reached, unit, count as i64)
}
