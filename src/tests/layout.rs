#[cfg(test)]
mod tests {
    use crate::dex::code::CodeItem;
    use crate::dex::ins::Ins;
    use crate::dex::opcodes::Opcode;
    use crate::dex::tries::{HandlerSet, TryItem, TryList};

    fn nop() -> Ins {
        Ins::new(Opcode::by_name("nop").unwrap())
    }

    #[test]
    fn addresses_and_labels_recover_after_insert_remove() {
        let mut item = CodeItem::new(2, 0, 0);
        item.push_instruction(nop());
        let mut branch = Ins::new(Opcode::by_name("if-eqz").unwrap());
        branch.set_byte_at(1, 0).unwrap();
        branch.set_target_address(4).unwrap();
        item.push_instruction(branch);
        item.push_instruction(nop());
        item.push_instruction(item_return());
        item.refresh().unwrap();

        let mut baseline = Vec::new();
        item.write(&mut baseline).unwrap();

        item.insert_instruction(2, nop()).unwrap();
        item.instruction_mut(1).unwrap().set_target_address(5).unwrap();
        item.refresh().unwrap();
        item.remove_instruction(2).unwrap();
        item.instruction_mut(1).unwrap().set_target_address(4).unwrap();
        item.refresh().unwrap();

        let mut restored = Vec::new();
        item.write(&mut restored).unwrap();
        assert_eq!(restored, baseline);
    }

    fn item_return() -> Ins {
        Ins::new(Opcode::by_name("return-void").unwrap())
    }

    // A try over [0x10, 0x20) with one typed handler and no catch-all
    // stores +1; adding a catch-all flips the count to -1 and appends the
    // catch-all address after the typed pair.
    #[test]
    fn handlers_count_sign_tracks_catch_all() {
        let mut handlers = HandlerSet::new();
        handlers.add_typed(0x21, 0x30);
        let mut list = TryList::new();
        list.push(TryItem::new(0x10, 0x10, handlers));

        let mut bytes = Vec::new();
        list.write(&mut bytes).unwrap();
        // tries array is 8 bytes, then uleb list count, then sleb size
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 1);

        list.get_mut(0).unwrap().handlers_mut().set_catch_all(0x40);
        let mut bytes = Vec::new();
        list.write(&mut bytes).unwrap();
        assert_eq!(bytes[9], 0x7F); // sleb128(-1)
        assert_eq!(*bytes.last().unwrap(), 0x40);
    }

    #[test]
    fn shared_handler_bytes_stay_stable_under_foreign_edit() {
        let shared = {
            let mut set = HandlerSet::new();
            set.add_typed(3, 0x18);
            set
        };
        let mut list = TryList::new();
        let first = TryItem::new(0, 8, shared);
        let mut second = TryItem::new(0x10, 8, HandlerSet::new());
        second.share_handlers_with(&first);
        list.push(first);
        list.push(second);

        let mut before = Vec::new();
        list.write(&mut before).unwrap();

        // editing the second try's handlers must not disturb the first
        list.get_mut(1).unwrap().handlers_mut().add_typed(5, 0x20);
        let mut after = Vec::new();
        list.write(&mut after).unwrap();
        assert_eq!(before[..8], after[..8]);

        let mut ix = 0;
        let read = TryList::read(&after, &mut ix, 2).unwrap();
        assert_eq!(read.get(0).unwrap().handlers().typed().len(), 1);
        assert_eq!(read.get(1).unwrap().handlers().typed().len(), 2);
        assert!(!read.get(0).unwrap().shares_handlers_with(read.get(1).unwrap()));
    }

    mod offsets {
        use crate::block::{offset_of, Block, BlockId, BlockList};

        struct Leaf {
            id: BlockId,
            size: usize,
        }

        impl Leaf {
            fn new(size: usize) -> Self {
                Leaf {
                    id: BlockId::next(),
                    size,
                }
            }
        }

        impl Block for Leaf {
            fn id(&self) -> BlockId {
                self.id
            }
            fn byte_size(&self) -> usize {
                self.size
            }
            fn refresh(&mut self) {}
            fn write_to(&self, out: &mut Vec<u8>) -> usize {
                out.extend(std::iter::repeat(0u8).take(self.size));
                self.size
            }
        }

        #[test]
        fn offset_counts_preceding_siblings_only() {
            let mut list: BlockList<Leaf> = BlockList::new();
            list.push(Leaf::new(8));
            list.push(Leaf::new(20));
            let target = Leaf::new(4);
            let target_id = target.id();
            list.push(target);
            list.push(Leaf::new(100));

            assert_eq!(offset_of(&list, target_id), Some(28));
            assert_eq!(offset_of(&list, BlockId::next()), None);
        }
    }

    mod keys {
        use crate::dex::key::MethodKey;
        use std::collections::HashMap;

        #[test]
        fn keys_identify_methods_across_locations() {
            let a = MethodKey::parse("Lcom/app/Main;->start(Landroid/os/Bundle;)V").unwrap();
            let b = MethodKey::parse(&a.to_string()).unwrap();

            let mut seen: HashMap<MethodKey, u32> = HashMap::new();
            seen.insert(a, 7);
            assert_eq!(seen.get(&b), Some(&7));
        }

        #[test]
        fn covariant_return_matching() {
            let base = MethodKey::parse("Lcom/app/A;->self()Lcom/app/A;").unwrap();
            let derived = MethodKey::parse("Lcom/app/B;->self()Lcom/app/B;").unwrap();
            assert!(base.equals_with(&derived, false, false));
            assert!(!base.equals_with(&derived, true, false));
            assert!(!base.equals_with(&derived, false, true));
        }
    }
}
