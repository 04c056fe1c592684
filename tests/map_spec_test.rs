use conduit::layout::LocalBlock;
use conduit::map::codec::FlatCodec;
use conduit::map::spec::parse_map_spec;
use conduit::map::{Dist, Map, RankList};

#[test]
fn textual_and_flat_descriptions_agree() {
    let spec = parse_map_spec("block(2, overlap=1) x blockcyclic(3, 4)").unwrap();
    let map = spec.place(RankList::contiguous(4, 6)).unwrap();

    // What an external preprocessing step would hand over.
    let words = map.serialize();
    let decoded = Map::deserialize(&words).unwrap();
    assert_eq!(decoded, map);
    assert_eq!(decoded.dists(), &[Dist::Block { overlap: 1 }, Dist::BlockCyclic { block: 4 }]);
    assert_eq!(decoded.grid().dims(), &[2, 3]);
}

#[test]
fn decoded_map_gives_the_same_local_blocks() {
    let map = parse_map_spec("cyclic(2) x block(2)")
        .unwrap()
        .place(RankList::contiguous(0, 4))
        .unwrap();
    let decoded = Map::deserialize(&map.serialize()).unwrap();
    let mut total = 0;
    for rank in 0..4 {
        let a = LocalBlock::new(&map, &[5, 6], rank).unwrap();
        let b = LocalBlock::new(&decoded, &[5, 6], rank).unwrap();
        assert_eq!(a.extents(), b.extents());
        for dim in 0..2 {
            assert_eq!(a.stored_indices(dim), b.stored_indices(dim));
        }
        total += a.len();
    }
    assert_eq!(total, 30);
}

#[test]
fn malformed_descriptions_are_rejected() {
    assert!(parse_map_spec("block(0)").is_err());
    assert!(parse_map_spec("blockcyclic(2, 0)").is_err());
    assert!(parse_map_spec("spiral(3)").is_err());
    assert!(Map::deserialize(&[1, 2, 1, 0]).is_err());
}
