#![allow(missing_docs)]

use paged_hnsw::hnsw::codec::{init_node, read_node};
use paged_hnsw::hnsw::{NodeLayout, NodeViewMut, Quantization, TOMBSTONE_KEY};
use paged_hnsw::SlotId;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn node_size_follows_tier_formula(
        dim in 1u32..512,
        m in 2u16..48,
        level in 0u16..12,
    ) {
        let layout = NodeLayout::new(dim, m, Quantization::None).unwrap();
        let m = m as usize;
        let expected = 8 + 2 + (4 + 8 * m) + level as usize * (4 + 4 * m) + 4 * dim as usize;
        prop_assert_eq!(layout.node_size(level), expected);
        prop_assert_eq!(layout.vector_bytes(), 4 * dim as usize);
    }

    #[test]
    fn nodes_pack_back_to_back(
        levels in proptest::collection::vec(0u16..4, 1..12),
        dim in 1u32..16,
    ) {
        let layout = NodeLayout::new(dim, 4, Quantization::None).unwrap();
        let total: usize = levels.iter().map(|&l| layout.node_size(l)).sum();
        let mut page = vec![0xABu8; total + 8];
        let mut offset = 0;
        for (i, &level) in levels.iter().enumerate() {
            offset += init_node(&mut page[offset..], &layout, i as u64, level, SlotId(i as u32)).unwrap();
        }
        prop_assert_eq!(offset, total);
        prop_assert!(page[total..].iter().all(|&b| b == 0xAB));

        let mut offset = 0;
        for (i, &level) in levels.iter().enumerate() {
            let (view, size, read_level) = read_node(&page, offset, &layout).unwrap();
            prop_assert_eq!(read_level, level);
            prop_assert_eq!(view.key(), i as u64);
            offset += size;
        }
    }

    #[test]
    fn neighbor_tiers_hold_up_to_capacity(
        base in proptest::collection::vec(0u32..10_000, 0..=8),
        upper in proptest::collection::vec(0u32..10_000, 0..=4),
        extra in 0u32..10_000,
    ) {
        let layout = NodeLayout::new(3, 4, Quantization::None).unwrap();
        let mut bytes = vec![0u8; layout.node_size(1)];
        init_node(&mut bytes, &layout, 9, 1, SlotId(0)).unwrap();
        let mut node = NodeViewMut::new(&mut bytes, &layout).unwrap();
        let base: Vec<SlotId> = base.into_iter().map(SlotId).collect();
        let upper: Vec<SlotId> = upper.into_iter().map(SlotId).collect();
        node.set_neighbors(0, &base).unwrap();
        node.set_neighbors(1, &upper).unwrap();

        let pushed = node.push_neighbor(1, SlotId(extra)).unwrap();
        prop_assert_eq!(pushed, upper.len() < 4);
        let mut expected_upper = upper.clone();
        if pushed {
            expected_upper.push(SlotId(extra));
        }
        let view = node.view();
        prop_assert_eq!(view.neighbors(0).unwrap().collect::<Vec<_>>(), base);
        prop_assert_eq!(view.neighbors(1).unwrap().collect::<Vec<_>>(), expected_upper);
        prop_assert!(view.neighbors(2).is_err());
        prop_assert!(node.set_neighbors(1, &[SlotId(1); 5]).is_err());
    }

    #[test]
    fn vectors_survive_tombstoning(values in proptest::collection::vec(-1e6f32..1e6, 6)) {
        let layout = NodeLayout::new(6, 2, Quantization::None).unwrap();
        let mut bytes = vec![0u8; layout.node_size(0)];
        init_node(&mut bytes, &layout, 1, 0, SlotId(0)).unwrap();
        let mut node = NodeViewMut::new(&mut bytes, &layout).unwrap();
        node.write_vector(&values).unwrap();
        node.clear_key();
        let view = node.view();
        prop_assert_eq!(view.key(), TOMBSTONE_KEY);
        prop_assert!(view.is_tombstone());
        prop_assert_eq!(view.vector().collect::<Vec<_>>(), values);
    }
}
