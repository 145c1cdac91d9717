use std::io::Cursor;

pub trait ReadCursorExt {
    fn read_cursor(&self, offset: usize) -> Option<Cursor<&[u8]>>;

    fn get_at(&self, offset: usize, size: usize) -> Option<&[u8]>;
}

impl ReadCursorExt for [u8] {
    fn read_cursor(&self, offset: usize) -> Option<Cursor<&[u8]>> {
        self.get(offset..).map(Cursor::new)
    }

    fn get_at(&self, offset: usize, size: usize) -> Option<&[u8]> {
        self.get(offset..offset.checked_add(size)?)
    }
}
