use crate::error::CollectError;
use crate::models::DateRange;
use chrono::{Duration, NaiveDate};

/// Upper bound on the length of one date chunk, in days.
pub const MAX_DAYS_PER_CHUNK: i64 = 366;

/// Date ranges to search with.
///
/// Without time chunking the configured range is used as a single chunk.
pub fn date_chunks(range: &DateRange, time_chunking: bool) -> Result<Vec<DateRange>, CollectError> {
    if !time_chunking {
        return Ok(vec![*range]);
    }

    match (range.start, range.end) {
        (Some(start), Some(end)) => split_date_range(start, end),
        _ => Err(CollectError::InvalidArgument(
            "time chunking needs both a start and an end date".to_string(),
        )),
    }
}

/// Splits `start..=end` into equal chunks of at most [`MAX_DAYS_PER_CHUNK`]
/// days. The last chunk absorbs the remainder and ends exactly at `end`.
pub fn split_date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<DateRange>, CollectError> {
    if end < start {
        return Err(CollectError::InvalidArgument(format!(
            "date range ends ({end}) before it starts ({start})"
        )));
    }

    let total_days = (end - start).num_days() + 1;
    let chunk_count = ((total_days + MAX_DAYS_PER_CHUNK - 1) / MAX_DAYS_PER_CHUNK).max(1);
    let days_per_chunk = total_days / chunk_count;

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    let mut cursor = start;

    for index in 0..chunk_count {
        let chunk_end = if index == chunk_count - 1 {
            end
        } else {
            cursor + Duration::days(days_per_chunk - 1)
        };

        chunks.push(DateRange::new(Some(cursor), Some(chunk_end)));
        cursor = chunk_end + Duration::days(1);
    }

    Ok(chunks)
}
