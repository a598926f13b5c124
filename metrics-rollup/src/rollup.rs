//! Global tag rollup.
//!
//! Percentiles cannot be re-aggregated across hosts after the fact, so latency and size
//! distributions are emitted once per granularity instead. Given an ordered list of "global" keys,
//! such as `["region", "az", "host", "container"]`, a tag set is expanded into one variant per key:
//! the first variant has every global key set to [`GLOBAL_TOKEN`], and each subsequent variant
//! restores the real value of the next key in the list.
//!
//! For `["region", "az", "host", "container"]` and the tags `region:us-west-2`, `az:a`,
//! `host:1234`, `team:search`, the variants are:
//!
//! ```text
//! region:global    az:global host:global team:search container:global
//! region:us-west-2 az:global host:global team:search container:global
//! region:us-west-2 az:a      host:global team:search container:global
//! region:us-west-2 az:a      host:1234   team:search container:global
//! ```
//!
//! Tags whose key is not a global key are copied through untouched, and every global key missing
//! from the input is added with the global token so that each dimension is present in every
//! variant.
use crate::tag::{Tag, GLOBAL_TOKEN};

/// Computes the rollup variants of `tags` for the given ordered list of global keys.
///
/// Exactly `global_keys.len()` variants are returned, most-masked first. Variant `k` keeps the
/// original values of the global keys at positions `< k` and masks the rest, so the last key in
/// the list is masked in every variant.
///
/// Keys are matched exactly. Global keys missing from `tags` are appended, in list order, after
/// the caller's tags; tag positions are identical across all variants.
///
/// If `global_keys` is empty, no variants are produced.
pub fn compute_variants<K>(tags: &[Tag], global_keys: &[K]) -> Vec<Vec<Tag>>
where
    K: AsRef<str>,
{
    if global_keys.is_empty() {
        return Vec::new();
    }

    let mut working = Vec::with_capacity(tags.len() + global_keys.len());
    working.extend_from_slice(tags);
    for key in global_keys {
        let key = key.as_ref();
        if !working.iter().any(|tag: &Tag| tag.key() == key) {
            working.push(Tag::new(key.to_owned(), GLOBAL_TOKEN));
        }
    }

    // Position of each working tag within `global_keys`, or `None` for pass-through tags.
    let positions = working
        .iter()
        .map(|tag| global_keys.iter().position(|key| key.as_ref() == tag.key()))
        .collect::<Vec<_>>();

    (0..global_keys.len())
        .map(|unmasked| {
            working
                .iter()
                .zip(&positions)
                .map(|(tag, position)| match position {
                    Some(position) if *position >= unmasked => tag.masked(),
                    _ => tag.clone(),
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::compute_variants;
    use crate::tag::Tag;

    fn tags(raw: &[&str]) -> Vec<Tag> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn render(variants: Vec<Vec<Tag>>) -> Vec<Vec<String>> {
        variants.into_iter().map(|v| v.iter().map(ToString::to_string).collect()).collect()
    }

    #[test]
    fn test_cascade_order() {
        let globals = ["region", "az", "host", "container"];
        let input = tags(&["region:test", "az:test", "host:test", "extra:value"]);

        let expected = vec![
            vec!["region:global", "az:global", "host:global", "extra:value", "container:global"],
            vec!["region:test", "az:global", "host:global", "extra:value", "container:global"],
            vec!["region:test", "az:test", "host:global", "extra:value", "container:global"],
            vec!["region:test", "az:test", "host:test", "extra:value", "container:global"],
        ];

        assert_eq!(render(compute_variants(&input, &globals)), expected);
    }

    #[test]
    fn test_empty_keys_produce_no_variants() {
        let input = tags(&["region:test"]);
        let globals: [&str; 0] = [];
        assert!(compute_variants(&input, &globals).is_empty());
    }

    #[test]
    fn test_missing_keys_are_synthesized() {
        let globals = ["region", "host"];
        let expected = vec![
            vec!["method:GET", "region:global", "host:global"],
            vec!["method:GET", "region:global", "host:global"],
        ];

        assert_eq!(render(compute_variants(&tags(&["method:GET"]), &globals)), expected);
    }

    #[test]
    fn test_key_prefixes_do_not_match() {
        let globals = ["host"];
        let input = tags(&["hostname:web-1"]);
        let expected = vec![vec!["hostname:web-1", "host:global"]];

        assert_eq!(render(compute_variants(&input, &globals)), expected);
    }

    #[test]
    fn test_single_key_is_always_masked() {
        let globals = ["region"];
        let input = tags(&["region:eu-central-1", "status:ok"]);
        let expected = vec![vec!["region:global", "status:ok"]];

        assert_eq!(render(compute_variants(&input, &globals)), expected);
    }

    #[test]
    fn test_repeated_keys_are_synthesized_once() {
        let globals = ["host", "host"];
        let expected = vec![vec!["host:global"], vec!["host:global"]];

        assert_eq!(render(compute_variants(&[], &globals)), expected);
    }

    #[test]
    fn test_input_order_is_preserved() {
        let globals = ["region", "az"];
        let input = tags(&["az:b", "status:ok", "region:us-east-1"]);
        let expected = vec![
            vec!["az:global", "status:ok", "region:global"],
            vec!["az:global", "status:ok", "region:us-east-1"],
        ];

        assert_eq!(render(compute_variants(&input, &globals)), expected);
    }
}
